//! Per-project extension points.
//!
//! Hooks are an ordered list on the project record. The orchestrator invokes
//! the hooks registered at each [`HookPoint`] in declaration order; hooks at
//! [`HookPoint::Build`] replace the toolchain's compile stage.
//!
//! `copy` and `msgfmt` hooks write into the stage directory. At
//! [`HookPoint::PostInstall`] that directory starts out empty and whatever
//! the hooks leave in it is installed and recorded for the project once the
//! last hook has run.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::builder::make::{MakeInvocation, run_make};
use crate::builder::{BuildError, StageContext};
use crate::context::BuildEnv;
use crate::install::copy_into;
use crate::project::{Project, ProjectPaths};
use crate::recipe::{HookAction, HookPoint, HookSpec};

/// View handed to closure hooks.
pub struct HookContext<'a> {
  pub project: &'a Project,
  pub version: &'a str,
  pub paths: &'a ProjectPaths,
  pub install_root: &'a Path,
  pub env: &'a mut BuildEnv,
}

pub type HookFn = Arc<dyn Fn(&mut HookContext<'_>) -> Result<(), BuildError> + Send + Sync>;

#[derive(Clone)]
pub enum Hook {
  /// Declared in the recipe.
  Spec(HookSpec),
  /// Registered programmatically.
  Fn { at: HookPoint, name: String, func: HookFn },
}

impl Hook {
  pub fn func<F>(at: HookPoint, name: impl Into<String>, func: F) -> Self
  where
    F: Fn(&mut HookContext<'_>) -> Result<(), BuildError> + Send + Sync + 'static,
  {
    Hook::Fn {
      at,
      name: name.into(),
      func: Arc::new(func),
    }
  }

  pub fn point(&self) -> HookPoint {
    match self {
      Hook::Spec(spec) => spec.at,
      Hook::Fn { at, .. } => *at,
    }
  }

  pub fn name(&self) -> String {
    match self {
      Hook::Spec(spec) => match &spec.action {
        HookAction::Cmd { .. } => "cmd".to_string(),
        HookAction::Env { var, .. } => format!("env {var}"),
        HookAction::Msgfmt { domain, .. } => format!("msgfmt {domain}"),
        HookAction::Make { makefile, .. } => format!("make {makefile}"),
        HookAction::Copy { from, .. } => format!("copy {from}"),
      },
      Hook::Fn { name, .. } => name.clone(),
    }
  }
}

impl fmt::Debug for Hook {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Hook::Spec(spec) => f.debug_tuple("Spec").field(spec).finish(),
      Hook::Fn { at, name, .. } => f.debug_struct("Fn").field("at", at).field("name", name).finish_non_exhaustive(),
    }
  }
}

/// Run every hook registered at `point`. Returns how many ran.
pub async fn run_hooks(point: HookPoint, cx: &mut StageContext<'_>) -> Result<usize, BuildError> {
  let project = cx.project;
  let mut count = 0;

  for hook in project.hooks_at(point) {
    info!(project = %project.name(), hook = %hook.name(), at = %point, "running hook");
    match hook {
      Hook::Spec(spec) => run_spec(point, &spec.action, cx).await?,
      Hook::Fn { func, .. } => {
        let mut hook_cx = HookContext {
          project,
          version: &cx.version,
          paths: &cx.paths,
          install_root: cx.context.install_root(),
          env: &mut cx.env,
        };
        func(&mut hook_cx)?;
      }
    }
    count += 1;
  }

  Ok(count)
}

async fn run_spec(point: HookPoint, action: &HookAction, cx: &mut StageContext<'_>) -> Result<(), BuildError> {
  let stage = point.to_string();
  match action {
    HookAction::Cmd { run, dir } => {
      let cwd = cx.source_path(dir.as_deref());
      cx.shell(&stage, run, &cwd).await?;
    }
    HookAction::Env { var, value } => {
      let value = cx.expand(value);
      debug!(var = %var, value = %value, "pushing hook environment");
      cx.env.push(var, value);
    }
    HookAction::Msgfmt { po_dir, domain } => compile_catalogs(cx, &stage, po_dir, domain).await?,
    HookAction::Make {
      makefile,
      dir,
      targets,
      vars,
    } => {
      let cwd = cx.source_path(dir.as_deref());
      let makefile = cx.expand(makefile);
      let targets: Vec<String> = targets.iter().map(|t| cx.expand(t)).collect();
      let vars: Vec<String> = vars.iter().map(|(k, v)| format!("{k}={}", cx.expand(v))).collect();
      run_make(
        cx,
        &stage,
        &cwd,
        MakeInvocation {
          makefile: &makefile,
          targets: &targets,
          vars: &vars,
        },
      )
      .await?;
    }
    HookAction::Copy { from, to } => {
      let from = cx.paths.source.join(cx.expand(from));
      let to = cx.paths.stage.join(cx.expand(to));
      copy_into(&from, &to)?;
    }
  }
  Ok(())
}

/// Compile `<po_dir>/<lang>.po` into `<stage>/share/locale/<lang>/LC_MESSAGES/<domain>.mo`.
async fn compile_catalogs(cx: &StageContext<'_>, stage: &str, po_dir: &str, domain: &str) -> Result<(), BuildError> {
  let po_dir = cx.source_path(Some(po_dir));
  let locale_dir = cx.paths.stage.join("share").join("locale");
  let msgfmt = &cx.context.programs().msgfmt;

  let catalogs: Vec<_> = WalkDir::new(&po_dir)
    .min_depth(1)
    .max_depth(1)
    .sort_by_file_name()
    .into_iter()
    .filter_map(Result::ok)
    .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|ext| ext == "po"))
    .map(|e| e.into_path())
    .collect();

  if catalogs.is_empty() {
    return Err(BuildError::Option {
      key: "po_dir".to_string(),
      reason: format!("no .po files in {}", po_dir.display()),
    });
  }

  for catalog in catalogs {
    let Some(lang) = catalog.file_stem().and_then(|s| s.to_str()) else {
      continue;
    };
    let messages_dir = locale_dir.join(lang).join("LC_MESSAGES");
    std::fs::create_dir_all(&messages_dir).map_err(|source| BuildError::Io {
      path: messages_dir.clone(),
      source,
    })?;
    let args = vec![
      "-c".to_string(),
      "-o".to_string(),
      messages_dir.join(format!("{domain}.mo")).to_string_lossy().into_owned(),
      catalog.to_string_lossy().into_owned(),
    ];
    cx.run(stage, msgfmt, &args, &po_dir).await?;
  }

  Ok(())
}
