//! Meson + Ninja.
//!
//! Every recipe option except `args` becomes a `-Dkey=value` project option;
//! `args` is passed to `meson setup` verbatim.

use async_trait::async_trait;

use super::{BuildError, Builder, StageContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct MesonBuilder;

const RESERVED: &[&str] = &["args"];

impl MesonBuilder {
  pub(crate) fn setup_args(cx: &StageContext<'_>) -> Vec<String> {
    let mut args = vec![
      "setup".to_string(),
      cx.paths.build.to_string_lossy().into_owned(),
      cx.paths.source.to_string_lossy().into_owned(),
      format!("--prefix={}", cx.paths.stage.display()),
      format!("--buildtype={}", cx.context.configuration().meson_buildtype()),
      "--libdir=lib".to_string(),
    ];
    args.extend(cx.define_options(RESERVED).into_iter().map(|d| format!("-D{d}")));
    args.extend(cx.option_list("args"));
    args
  }
}

#[async_trait]
impl Builder for MesonBuilder {
  fn name(&self) -> &'static str {
    "meson"
  }

  async fn configure(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let meson = &cx.context.programs().meson;
    cx.run("configure", meson, &Self::setup_args(cx), &cx.paths.source).await?;
    Ok(())
  }

  async fn compile(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let ninja = &cx.context.programs().ninja;
    let args = vec![
      "-C".to_string(),
      cx.paths.build.to_string_lossy().into_owned(),
      "-j".to_string(),
      cx.context.parallelism().to_string(),
    ];
    cx.run("compile", ninja, &args, &cx.paths.build).await?;
    Ok(())
  }

  async fn install(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let ninja = &cx.context.programs().ninja;
    let args = vec![
      "-C".to_string(),
      cx.paths.build.to_string_lossy().into_owned(),
      "install".to_string(),
    ];
    cx.run("install", ninja, &args, &cx.paths.build).await?;
    Ok(())
  }
}
