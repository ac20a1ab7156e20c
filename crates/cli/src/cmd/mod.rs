mod build;
mod clean;
mod list;
mod manifest;
mod outdated;
mod plan;

use anyhow::{Context, Result};
use nbuild_lib::config::Config;
use nbuild_lib::registry::ProjectRegistry;
use tracing::debug;

use crate::Settings;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use list::cmd_list;
pub use manifest::cmd_manifest;
pub use outdated::cmd_outdated;
pub use plan::cmd_plan;

/// At least one project failed, was skipped or was cancelled.
pub const EXIT_FAILED: u8 = 1;
/// Bad configuration, recipe or request; nothing was built.
pub const EXIT_SETUP: u8 = 2;

/// Config file and environment, then command-line overrides.
fn load_config(settings: &Settings, jobs: Option<usize>) -> Result<Config> {
  let mut config = Config::load(settings.config.as_deref()).context("Failed to load configuration")?;

  if let Some(dir) = &settings.install_root {
    config.install_root = dir.clone();
  }
  if let Some(dir) = &settings.recipes {
    config.recipes_dir = dir.clone();
  }
  if let Some(dir) = &settings.patches {
    config.patch_dir = dir.clone();
  }
  config.features.extend(settings.features.iter().cloned());
  if let Some(jobs) = jobs {
    config.parallelism = jobs;
  }
  config.absolutize().context("Invalid configuration")?;
  config.validate().context("Invalid configuration")?;

  Ok(config)
}

fn load_registry(config: &Config) -> Result<ProjectRegistry> {
  let mut registry = ProjectRegistry::new();
  let count = registry
    .load_dir_with_features(&config.recipes_dir, &config.features)
    .with_context(|| format!("Failed to load recipes from {}", config.recipes_dir.display()))?;
  debug!(count, dir = %config.recipes_dir.display(), features = ?config.features, "recipes loaded");
  Ok(registry)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}
