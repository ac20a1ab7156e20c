//! Raw shell stages.
//!
//! The `configure`, `compile` and `install` options each hold a list of
//! command lines run through the platform shell from the source root.
//! Placeholders such as `{stage}` are expanded before running.

use async_trait::async_trait;

use super::{BuildError, Builder, StageContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptBuilder;

impl ScriptBuilder {
  async fn run_stage(cx: &StageContext<'_>, stage: &str) -> Result<(), BuildError> {
    for line in cx.option_list(stage) {
      cx.shell(stage, &line, &cx.paths.source).await?;
    }
    Ok(())
  }
}

#[async_trait]
impl Builder for ScriptBuilder {
  fn name(&self) -> &'static str {
    "script"
  }

  async fn configure(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    Self::run_stage(cx, "configure").await
  }

  async fn compile(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    Self::run_stage(cx, "compile").await
  }

  async fn install(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    Self::run_stage(cx, "install").await
  }
}
