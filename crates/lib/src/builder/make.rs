//! Makefile-driven builds (`make`, or `nmake` on Windows).
//!
//! Used both as a full toolchain and, through the `make` hook, for code
//! generation sub-steps such as introspection data. Options:
//! - `makefile` (default `Makefile`) and `dir` (relative to the source root)
//! - `targets`: goals for the compile step
//! - `vars`: `NAME=value` macro definitions passed to every invocation
//! - `install_target` (default `install`); `false` skips the install step

use std::path::Path;

use async_trait::async_trait;

use super::{BuildError, Builder, StageContext};
use crate::recipe::OptionValue;

#[derive(Debug, Clone, Copy, Default)]
pub struct MakeBuilder;

/// One make invocation.
pub(crate) struct MakeInvocation<'a> {
  pub makefile: &'a str,
  pub targets: &'a [String],
  pub vars: &'a [String],
}

impl MakeInvocation<'_> {
  pub fn args(&self) -> Vec<String> {
    let mut args = vec!["-f".to_string(), self.makefile.to_string()];
    args.extend(self.targets.iter().cloned());
    args.extend(self.vars.iter().cloned());
    args
  }
}

/// Run one make invocation with the lane environment.
pub(crate) async fn run_make(
  cx: &StageContext<'_>,
  stage: &str,
  cwd: &Path,
  invocation: MakeInvocation<'_>,
) -> Result<(), BuildError> {
  let make = &cx.context.programs().make;
  cx.run(stage, make, &invocation.args(), cwd).await?;
  Ok(())
}

impl MakeBuilder {
  fn makefile(cx: &StageContext<'_>) -> String {
    cx.option_str("makefile").unwrap_or_else(|| "Makefile".to_string())
  }

  fn install_target(cx: &StageContext<'_>) -> Option<String> {
    match cx.option("install_target") {
      Some(OptionValue::Bool(false)) => None,
      Some(OptionValue::Bool(true)) | None => Some("install".to_string()),
      Some(other) => Some(cx.expand(&other.render())),
    }
  }
}

#[async_trait]
impl Builder for MakeBuilder {
  fn name(&self) -> &'static str {
    "make"
  }

  async fn configure(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let dir = cx.source_path(cx.option_str("dir").as_deref());
    let makefile = dir.join(Self::makefile(cx));
    if !makefile.is_file() {
      return Err(BuildError::Option {
        key: "makefile".to_string(),
        reason: format!("{} does not exist", makefile.display()),
      });
    }
    Ok(())
  }

  async fn compile(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let dir = cx.source_path(cx.option_str("dir").as_deref());
    let makefile = Self::makefile(cx);
    let targets = cx.option_list("targets");
    let vars = cx.option_list("vars");
    run_make(
      cx,
      "compile",
      &dir,
      MakeInvocation {
        makefile: &makefile,
        targets: &targets,
        vars: &vars,
      },
    )
    .await
  }

  async fn install(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let Some(target) = Self::install_target(cx) else {
      return Ok(());
    };
    let dir = cx.source_path(cx.option_str("dir").as_deref());
    let makefile = Self::makefile(cx);
    let mut vars = cx.option_list("vars");
    vars.push(format!("PREFIX={}", cx.paths.stage.display()));
    run_make(
      cx,
      "install",
      &dir,
      MakeInvocation {
        makefile: &makefile,
        targets: &[target],
        vars: &vars,
      },
    )
    .await
  }
}
