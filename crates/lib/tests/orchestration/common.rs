//! Shared helpers for end-to-end orchestration tests.
//!
//! Every project is a `script` toolchain project whose source is a tarball
//! in a local mirror, fetched through a `file://` URL.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use nbuild_lib::config::Config;
use nbuild_lib::context::BuildContext;
use nbuild_lib::orchestrate::{BuildRequest, Orchestrator, RunSummary};
use nbuild_lib::project::Project;
use nbuild_lib::recipe::Recipe;
use nbuild_lib::registry::ProjectRegistry;
use nbuild_lib::util::hash::hash_bytes;
use reqwest::Url;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Default script stages: the source is "compiled" into `built.txt` and
/// installed as `lib/<name>.txt`.
pub const COMPILE: &str = "cat src.txt > built.txt";
pub const INSTALL: &[&str] = &["mkdir -p {stage}/lib", "cp built.txt {stage}/lib/{name}.txt"];

pub struct Workspace {
  pub temp: TempDir,
  pub config: Config,
}

impl Workspace {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let root = dunce::canonicalize(temp.path()).unwrap();
    let config = Config {
      install_root: root.join("install"),
      build_root: root.join("build"),
      cache_dir: root.join("cache"),
      recipes_dir: root.join("recipes"),
      patch_dir: root.join("patches"),
      parallelism: 4,
      fetch_retries: 0,
      retry_backoff_ms: 1,
      ..Config::default()
    };
    Self { temp, config }
  }

  pub fn root(&self) -> PathBuf {
    self.config.install_root.parent().unwrap().to_path_buf()
  }

  /// Write `<mirror>/<name>-1.0.tar.gz` holding `src.txt` under a top-level
  /// directory. Returns its SHA-256.
  pub fn archive(&self, name: &str) -> String {
    let mirror = self.root().join("mirror");
    fs::create_dir_all(&mirror).unwrap();

    let contents = format!("source of {name}\n");
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
      .append_data(&mut header, format!("{name}-1.0/src.txt"), contents.as_bytes())
      .unwrap();
    let bytes = builder.into_inner().unwrap().finish().unwrap();

    fs::write(mirror.join(format!("{name}-1.0.tar.gz")), &bytes).unwrap();
    hash_bytes(&bytes).0
  }

  /// A script project with the default stages plus `extra` TOML lines.
  pub fn project(&self, name: &str, deps: &[&str], compile: &[&str], extra: &str) -> Project {
    let sha = self.archive(name);
    let mirror = Url::from_directory_path(self.root().join("mirror")).unwrap();
    let list = |items: &[&str]| {
      items
        .iter()
        .map(|i| format!("{i:?}"))
        .collect::<Vec<_>>()
        .join(", ")
    };

    let recipe: Recipe = toml::from_str(&format!(
      r#"
name = "{name}"
version = "1.0"
archive_url = "{mirror}{name}-{{version}}.tar.gz"
integrity_hash = "{sha}"
toolchain = "script"
dependencies = [{deps}]
{extra}

[options]
configure = ["test -f src.txt"]
compile = [{compile}]
install = [{install}]
"#,
      deps = list(deps),
      compile = list(compile),
      install = list(INSTALL),
    ))
    .unwrap();
    Project::from_recipe(recipe).unwrap()
  }

  pub fn orchestrator(&self, projects: Vec<Project>) -> Orchestrator {
    let mut registry = ProjectRegistry::new();
    for project in projects {
      registry.register(project).unwrap();
    }
    let context = BuildContext::with_base_env(&self.config, [("PATH".to_string(), "/usr/bin:/bin".to_string())]);
    Orchestrator::with_context(Arc::new(registry), self.config.clone(), context)
  }

  pub fn installed(&self, rel: &str) -> PathBuf {
    self.config.install_root.join(rel)
  }

  pub fn manifest_bytes(&self) -> Vec<u8> {
    fs::read(self.config.install_root.join(".nbuild/manifest.json")).unwrap()
  }
}

pub async fn run(orchestrator: &Orchestrator, request: BuildRequest) -> RunSummary {
  orchestrator.run(&request, CancellationToken::new()).await.unwrap()
}

pub fn position(summary: &RunSummary, name: &str) -> usize {
  summary.order.iter().position(|n| n == name).unwrap()
}

pub fn read(path: &Path) -> String {
  fs::read_to_string(path).unwrap()
}
