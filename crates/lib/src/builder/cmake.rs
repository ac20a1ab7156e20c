//! CMake, Ninja generator by default.
//!
//! Recipe options become `-Dkey=value` cache entries except `generator`
//! (overrides `-G`) and `args` (passed verbatim).

use async_trait::async_trait;

use super::{BuildError, Builder, StageContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct CmakeBuilder;

const RESERVED: &[&str] = &["args", "generator"];

impl CmakeBuilder {
  pub(crate) fn configure_args(cx: &StageContext<'_>) -> Vec<String> {
    let generator = cx.option_str("generator").unwrap_or_else(|| "Ninja".to_string());
    let mut args = vec![
      "-S".to_string(),
      cx.paths.source.to_string_lossy().into_owned(),
      "-B".to_string(),
      cx.paths.build.to_string_lossy().into_owned(),
      "-G".to_string(),
      generator,
      format!("-DCMAKE_INSTALL_PREFIX={}", cx.paths.stage.display()),
      format!("-DCMAKE_BUILD_TYPE={}", cx.context.configuration().cmake_build_type()),
    ];
    args.extend(cx.define_options(RESERVED).into_iter().map(|d| format!("-D{d}")));
    args.extend(cx.option_list("args"));
    args
  }
}

#[async_trait]
impl Builder for CmakeBuilder {
  fn name(&self) -> &'static str {
    "cmake"
  }

  async fn configure(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let cmake = &cx.context.programs().cmake;
    cx.run("configure", cmake, &Self::configure_args(cx), &cx.paths.source).await?;
    Ok(())
  }

  async fn compile(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let cmake = &cx.context.programs().cmake;
    let args = vec![
      "--build".to_string(),
      cx.paths.build.to_string_lossy().into_owned(),
      "--config".to_string(),
      cx.context.configuration().cmake_build_type().to_string(),
      "--parallel".to_string(),
      cx.context.parallelism().to_string(),
    ];
    cx.run("compile", cmake, &args, &cx.paths.build).await?;
    Ok(())
  }

  async fn install(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let cmake = &cx.context.programs().cmake;
    let args = vec![
      "--install".to_string(),
      cx.paths.build.to_string_lossy().into_owned(),
      "--config".to_string(),
      cx.context.configuration().cmake_build_type().to_string(),
    ];
    cx.run("install", cmake, &args, &cx.paths.build).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::testutil::*;
  use tempfile::TempDir;

  #[test]
  fn configure_args_use_stage_prefix() {
    let temp = TempDir::new().unwrap();
    let project = project(
      r#"
name = "libpng"
version = "1.6.43"
repository = "https://github.com/glennrp/libpng"
toolchain = "cmake"

[options]
PNG_TESTS = "OFF"
generator = "NMake Makefiles"
"#,
    );
    let context = build_context(temp.path());
    let cx = stage_context(&project, &context, temp.path());

    let args = CmakeBuilder::configure_args(&cx);
    let generator = args.iter().position(|a| a == "-G").unwrap();
    assert_eq!(args[generator + 1], "NMake Makefiles");
    assert!(args.contains(&format!("-DCMAKE_INSTALL_PREFIX={}", cx.paths.stage.display())));
    assert!(args.contains(&"-DCMAKE_BUILD_TYPE=Release".to_string()));
    assert!(args.contains(&"-DPNG_TESTS=OFF".to_string()));
    assert!(!args.iter().any(|a| a.starts_with("-Dgenerator")));
  }
}
