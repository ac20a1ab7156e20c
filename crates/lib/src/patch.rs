//! Patch engine.
//!
//! Patches are applied in list order with `patch -p1`, stopping at the first
//! failure. A partially patched tree is left as is; the caller must re-extract
//! the source before trying again, so patches are only ever applied to a
//! freshly extracted tree.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::builder::BuildError;
use crate::context::BuildEnv;
use crate::process::ProcessRunner;
use crate::util::hash::hash_file;

#[derive(Debug, Error)]
pub enum PatchError {
  #[error("patch #{index} ({patch}) failed to apply: {reason}")]
  Apply { index: usize, patch: String, reason: String },

  #[error("cancelled while patching")]
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct PatchEngine {
  patch_dir: PathBuf,
  program: String,
}

impl PatchEngine {
  pub fn new(patch_dir: impl Into<PathBuf>, program: impl Into<String>) -> Self {
    Self {
      patch_dir: patch_dir.into(),
      program: program.into(),
    }
  }

  /// `<patch_dir>/<project>/<patch>` if present, else `<patch_dir>/<patch>`.
  pub fn resolve(&self, project: &str, patch: &str) -> Option<PathBuf> {
    [self.patch_dir.join(project).join(patch), self.patch_dir.join(patch)]
      .into_iter()
      .find(|p| p.is_file())
  }

  /// Content digests of the patch list, in order. A missing patch contributes
  /// a placeholder so the list can still be fingerprinted; applying it fails.
  pub fn digests(&self, project: &str, patches: &[String]) -> Vec<String> {
    patches
      .iter()
      .map(|patch| {
        self
          .resolve(project, patch)
          .and_then(|path| hash_file(&path).ok())
          .map(|h| h.0)
          .unwrap_or_else(|| format!("missing:{patch}"))
      })
      .collect()
  }

  /// Apply `patches` to `source_root` in order. Returns how many were applied.
  pub async fn apply(
    &self,
    project: &str,
    source_root: &Path,
    patches: &[String],
    runner: &ProcessRunner,
    env: &BuildEnv,
  ) -> Result<usize, PatchError> {
    for (i, patch) in patches.iter().enumerate() {
      let index = i + 1;
      let Some(path) = self.resolve(project, patch) else {
        return Err(PatchError::Apply {
          index,
          patch: patch.clone(),
          reason: format!("not found in {}", self.patch_dir.display()),
        });
      };

      info!(project, index, patch = %patch, "applying patch");
      let args = vec![
        "-p1".to_string(),
        "--forward".to_string(),
        "--batch".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
      ];
      match runner.run("patch", &self.program, &args, source_root, env).await {
        Ok(_) => {}
        Err(BuildError::Cancelled) => return Err(PatchError::Cancelled),
        Err(e) => {
          return Err(PatchError::Apply {
            index,
            patch: patch.clone(),
            reason: e.to_string(),
          });
        }
      }
    }

    Ok(patches.len())
  }
}
