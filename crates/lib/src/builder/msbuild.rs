//! Visual Studio solutions driven by MSBuild.
//!
//! Options:
//! - `solution`: path of the `.sln` relative to the source root (required)
//! - `properties`: `Name=Value` entries passed as `/p:Name=Value`
//! - `args`: extra MSBuild arguments
//! - `outputs`: `from=to` entries copied into the stage by the install step;
//!   the last component of `from` may contain `*` wildcards

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{BuildError, Builder, StageContext};
use crate::install::copy_into;

#[derive(Debug, Clone, Copy, Default)]
pub struct MsbuildBuilder;

impl MsbuildBuilder {
  fn solution(cx: &StageContext<'_>) -> Result<PathBuf, BuildError> {
    let solution = cx.option_str("solution").ok_or_else(|| BuildError::Option {
      key: "solution".to_string(),
      reason: "msbuild projects must name a solution file".to_string(),
    })?;
    Ok(cx.paths.source.join(solution))
  }

  pub(crate) fn build_args(cx: &StageContext<'_>, solution: &Path) -> Vec<String> {
    let mut args = vec![
      solution.to_string_lossy().into_owned(),
      format!("/p:Configuration={}", cx.context.configuration().cmake_build_type()),
      format!("/p:Platform={}", cx.context.arch().msbuild_platform()),
      "/maxcpucount".to_string(),
      "/nologo".to_string(),
    ];
    args.extend(cx.option_list("properties").into_iter().map(|p| format!("/p:{p}")));
    args.extend(cx.option_list("args"));
    args
  }
}

#[async_trait]
impl Builder for MsbuildBuilder {
  fn name(&self) -> &'static str {
    "msbuild"
  }

  /// Solutions are generated ahead of time; only check the file is there.
  async fn configure(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let solution = Self::solution(cx)?;
    if !solution.is_file() {
      return Err(BuildError::Option {
        key: "solution".to_string(),
        reason: format!("{} does not exist", solution.display()),
      });
    }
    Ok(())
  }

  async fn compile(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    let solution = Self::solution(cx)?;
    let cwd = solution.parent().unwrap_or(&cx.paths.source).to_path_buf();
    let msbuild = &cx.context.programs().msbuild;
    cx.run("compile", msbuild, &Self::build_args(cx, &solution), &cwd).await?;
    Ok(())
  }

  async fn install(&self, cx: &StageContext<'_>) -> Result<(), BuildError> {
    for entry in cx.option_list("outputs") {
      let (from, to) = entry.split_once('=').ok_or_else(|| BuildError::Option {
        key: "outputs".to_string(),
        reason: format!("'{entry}' is not a from=to pair"),
      })?;
      let dest = cx.paths.stage.join(to.trim());
      for file in expand_pattern(&cx.paths.source, from.trim())? {
        copy_into(&file, &dest)?;
      }
    }
    Ok(())
  }
}

/// Resolve `pattern` against `base`. A `*` in the last component matches any
/// run of characters; a pattern without `*` must name an existing path.
fn expand_pattern(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, BuildError> {
  let full = base.join(pattern);
  let Some(file_pattern) = full.file_name().and_then(|f| f.to_str()).filter(|f| f.contains('*')) else {
    return Ok(vec![full]);
  };
  let dir = full.parent().unwrap_or(base);

  let entries = std::fs::read_dir(dir).map_err(|source| BuildError::Io {
    path: dir.to_path_buf(),
    source,
  })?;
  let mut matches: Vec<PathBuf> = entries
    .filter_map(Result::ok)
    .filter(|e| e.file_name().to_str().is_some_and(|name| wildcard_match(file_pattern, name)))
    .map(|e| e.path())
    .collect();
  matches.sort();

  if matches.is_empty() {
    return Err(BuildError::Option {
      key: "outputs".to_string(),
      reason: format!("'{pattern}' matched no files"),
    });
  }
  Ok(matches)
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
  let parts: Vec<&str> = pattern.split('*').collect();
  let (first, rest) = match parts.split_first() {
    Some(split) => split,
    None => return name.is_empty(),
  };
  let Some(mut remaining) = name.strip_prefix(first) else {
    return false;
  };
  let Some((last, middle)) = rest.split_last() else {
    return remaining.is_empty();
  };
  for part in middle {
    match remaining.find(part) {
      Some(pos) => remaining = &remaining[pos + part.len()..],
      None => return false,
    }
  }
  remaining.len() >= last.len() && remaining.ends_with(last)
}
