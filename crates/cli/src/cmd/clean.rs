//! Implementation of the `nbuild clean` command.

use anyhow::{Context, Result};
use serde_json::json;

use nbuild_lib::install::ArtifactInstaller;

use super::load_config;
use crate::Settings;
use crate::output::{OutputFormat, print_json, print_success};

/// Remove the files `name` installed. Files shared with another installed
/// project are kept.
pub fn cmd_clean(settings: &Settings, name: &str, format: OutputFormat) -> Result<u8> {
  let config = load_config(settings, None)?;
  let installer = ArtifactInstaller::new(&config.install_root);

  let removed = installer
    .uninstall(name)
    .with_context(|| format!("Failed to uninstall '{name}'"))?;

  if format.is_json() {
    print_json(&json!({ "project": name, "removed": removed }))?;
  } else {
    print_success(&format!("Removed {removed} file(s) installed by {name}"));
  }

  Ok(0)
}
