//! Toolchain adapters behind one three-stage interface.
//!
//! The orchestrator drives every project through [`Builder::configure`],
//! [`Builder::compile`] and [`Builder::install`] without knowing which
//! external build system sits behind them. Adapters install into the
//! project's staging directory; the artifact installer moves the staged tree
//! into the install root afterwards.

mod cmake;
pub(crate) mod make;
mod meson;
mod msbuild;
mod script;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{BuildContext, BuildEnv};
use crate::install::{InstallError, copy_into};
use crate::process::ProcessRunner;
use crate::project::{Project, ProjectPaths};
use crate::recipe::{HookPoint, OptionValue, ToolchainKind};

pub use cmake::CmakeBuilder;
pub use make::MakeBuilder;
pub use meson::MesonBuilder;
pub use msbuild::MsbuildBuilder;
pub use script::ScriptBuilder;

fn display_code(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {code}"),
    None => "no exit code (terminated by signal)".to_string(),
  }
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("{stage}: `{program}` failed with {}\n{tail}", display_code(.code))]
  Command {
    stage: String,
    program: String,
    code: Option<i32>,
    /// Last lines of the command output.
    tail: String,
  },

  #[error("failed to start `{program}`: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("cancelled")]
  Cancelled,

  #[error("invalid option '{key}': {reason}")]
  Option { key: String, reason: String },

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{point} hook '{name}' failed: {reason}")]
  Hook {
    point: HookPoint,
    name: String,
    reason: String,
  },

  #[error(transparent)]
  Install(#[from] InstallError),
}

/// Everything a stage needs about the project being built.
///
/// Owns the project's environment lane; dropping the context discards every
/// push made while building the project.
pub struct StageContext<'a> {
  pub project: &'a Project,
  /// Resolved version (never `"auto"`).
  pub version: String,
  pub paths: ProjectPaths,
  pub env: BuildEnv,
  pub runner: ProcessRunner,
  pub context: &'a BuildContext,
}

impl StageContext<'_> {
  pub fn option(&self, key: &str) -> Option<&OptionValue> {
    self.project.recipe.options.get(key)
  }

  /// A list option with placeholders expanded; missing means empty.
  pub fn option_list(&self, key: &str) -> Vec<String> {
    self
      .option(key)
      .map(|v| v.as_list().iter().map(|s| self.expand(s)).collect())
      .unwrap_or_default()
  }

  pub fn option_str(&self, key: &str) -> Option<String> {
    self.option(key).map(|v| self.expand(&v.render()))
  }

  /// Options not consumed by the adapter itself, rendered as `key=value`.
  pub fn define_options(&self, reserved: &[&str]) -> Vec<String> {
    self
      .project
      .recipe
      .options
      .iter()
      .filter(|(k, _)| !reserved.contains(&k.as_str()))
      .map(|(k, v)| format!("{k}={}", self.expand(&v.render())))
      .collect()
  }

  /// Substitute `{name}`, `{version}`, `{source}`, `{build}`, `{stage}` and `{install_root}`.
  pub fn expand(&self, text: &str) -> String {
    if !text.contains('{') {
      return text.to_string();
    }
    text
      .replace("{name}", self.project.name())
      .replace("{version}", &self.version)
      .replace("{source}", &self.paths.source.to_string_lossy())
      .replace("{build}", &self.paths.build.to_string_lossy())
      .replace("{stage}", &self.paths.stage.to_string_lossy())
      .replace("{install_root}", &self.context.install_root().to_string_lossy())
  }

  /// Resolve a recipe-relative directory against the source root.
  pub fn source_path(&self, relative: Option<&str>) -> PathBuf {
    match relative {
      Some(rel) if !rel.is_empty() => self.paths.source.join(self.expand(rel)),
      _ => self.paths.source.clone(),
    }
  }

  pub async fn run(&self, stage: &str, program: &str, args: &[String], cwd: &Path) -> Result<String, BuildError> {
    self.runner.run(stage, program, args, cwd, &self.env).await
  }

  pub async fn shell(&self, stage: &str, script: &str, cwd: &Path) -> Result<String, BuildError> {
    self.runner.shell(stage, &self.expand(script), cwd, &self.env).await
  }
}

#[async_trait]
pub trait Builder: Send + Sync {
  fn name(&self) -> &'static str;

  /// Translate the project's options into the backend's configuration step.
  async fn configure(&self, cx: &StageContext<'_>) -> Result<(), BuildError>;

  /// Run the backend's build command.
  async fn compile(&self, cx: &StageContext<'_>) -> Result<(), BuildError>;

  /// Install build outputs into the staging directory.
  async fn install(&self, cx: &StageContext<'_>) -> Result<(), BuildError>;
}

impl ToolchainKind {
  pub fn builder(&self) -> Box<dyn Builder> {
    match self {
      ToolchainKind::Meson => Box::new(MesonBuilder),
      ToolchainKind::Cmake => Box::new(CmakeBuilder),
      ToolchainKind::Msbuild => Box::new(MsbuildBuilder),
      ToolchainKind::Make => Box::new(MakeBuilder),
      ToolchainKind::Script => Box::new(ScriptBuilder),
    }
  }
}

/// The toolchain install stage followed by the recipe's install mappings.
pub async fn install_stage(builder: &dyn Builder, cx: &StageContext<'_>) -> Result<(), BuildError> {
  builder.install(cx).await?;
  apply_install_mappings(cx)
}

/// Copy each `{ from, to }` mapping from the source root into the staged tree.
pub fn apply_install_mappings(cx: &StageContext<'_>) -> Result<(), BuildError> {
  for mapping in &cx.project.recipe.install {
    let from = cx.paths.source.join(cx.expand(&mapping.from));
    let to = cx.paths.stage.join(cx.expand(&mapping.to));
    copy_into(&from, &to)?;
  }
  Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
  use super::*;
  use crate::config::Config;
  use crate::recipe::Recipe;
  use tokio_util::sync::CancellationToken;

  /// A project from one recipe written as a standalone TOML document.
  pub fn project(toml: &str) -> Project {
    let recipe: Recipe = toml::from_str(toml).unwrap();
    Project::from_recipe(recipe).unwrap()
  }

  pub fn build_context(install_root: &Path) -> BuildContext {
    let config = Config {
      install_root: install_root.to_path_buf(),
      ..Config::default()
    };
    BuildContext::with_base_env(&config, [("PATH".to_string(), "/usr/bin:/bin".to_string())])
  }

  pub fn stage_context<'a>(project: &'a Project, context: &'a BuildContext, build_root: &Path) -> StageContext<'a> {
    let paths = ProjectPaths::new(build_root, project.name());
    std::fs::create_dir_all(&paths.source).unwrap();
    std::fs::create_dir_all(&paths.build).unwrap();
    std::fs::create_dir_all(&paths.stage).unwrap();
    StageContext {
      project,
      version: project.recipe.version.clone(),
      runner: ProcessRunner::new(paths.logs.clone(), CancellationToken::new()),
      env: context.lane(),
      paths,
      context,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::testutil::*;
  use super::*;
  use tempfile::TempDir;

  const CAIRO: &str = r#"
name = "cairo"
version = "1.18.0"
repository = "https://gitlab.freedesktop.org/cairo/cairo"
toolchain = "meson"
install = [{ from = "COPYING", to = "share/doc/{name}" }]

[options]
freetype = "enabled"
default_library = "static"
args = ["--wrap-mode=nofallback"]
"#;

  #[test]
  fn expand_substitutes_paths() {
    let temp = TempDir::new().unwrap();
    let project = project(CAIRO);
    let context = build_context(&temp.path().join("install"));
    let cx = stage_context(&project, &context, temp.path());

    assert_eq!(cx.expand("{name}-{version}"), "cairo-1.18.0");
    assert_eq!(
      cx.expand("{install_root}/include"),
      format!("{}/include", temp.path().join("install").display())
    );
    assert_eq!(cx.expand("no placeholders"), "no placeholders");
  }

  #[test]
  fn define_options_skips_reserved_keys() {
    let temp = TempDir::new().unwrap();
    let project = project(CAIRO);
    let context = build_context(temp.path());
    let cx = stage_context(&project, &context, temp.path());

    assert_eq!(
      cx.define_options(&["args"]),
      vec!["default_library=static", "freetype=enabled"]
    );
    assert_eq!(cx.option_list("args"), vec!["--wrap-mode=nofallback"]);
    assert!(cx.option_list("missing").is_empty());
  }

  #[test]
  fn install_mappings_copy_license() {
    let temp = TempDir::new().unwrap();
    let project = project(CAIRO);
    let context = build_context(temp.path());
    let cx = stage_context(&project, &context, temp.path());
    std::fs::write(cx.paths.source.join("COPYING"), "LGPL").unwrap();

    apply_install_mappings(&cx).unwrap();

    let copied = cx.paths.stage.join("share/doc/cairo/COPYING");
    assert_eq!(std::fs::read_to_string(copied).unwrap(), "LGPL");
  }

  #[test]
  fn missing_install_source_is_install_error() {
    let temp = TempDir::new().unwrap();
    let project = project(CAIRO);
    let context = build_context(temp.path());
    let cx = stage_context(&project, &context, temp.path());

    let err = apply_install_mappings(&cx).unwrap_err();
    assert!(matches!(err, BuildError::Install(InstallError::MissingSource { .. })));
  }

  #[test]
  fn command_error_message_includes_code() {
    let err = BuildError::Command {
      stage: "compile".to_string(),
      program: "ninja".to_string(),
      code: Some(1),
      tail: "error: foo.c".to_string(),
    };
    assert_eq!(err.to_string(), "compile: `ninja` failed with exit code 1\nerror: foo.c");
  }
}
