//! Implementation of the `nbuild manifest` command.

use anyhow::{Context, Result};

use nbuild_lib::install::ArtifactInstaller;

use super::load_config;
use crate::Settings;
use crate::output::{OutputFormat, print_json, print_stat, truncate_hash};

/// Print the files `name` installed, as recorded in the install manifest.
pub fn cmd_manifest(settings: &Settings, name: &str, format: OutputFormat) -> Result<u8> {
  let config = load_config(settings, None)?;
  let installer = ArtifactInstaller::new(&config.install_root);

  let entry = installer
    .entry(name)
    .context("Failed to read install manifest")?
    .with_context(|| format!("Project '{name}' is not installed"))?;

  if format.is_json() {
    print_json(&entry)?;
    return Ok(0);
  }

  println!("{name} {}", entry.version);
  print_stat("Installed", &entry.installed_at);
  print_stat("Fingerprint", truncate_hash(&entry.fingerprint.0));
  print_stat("Files", &entry.files.len().to_string());
  println!();
  for file in &entry.files {
    println!("  {file}");
  }

  Ok(0)
}
