//! Implementation of the `nbuild outdated` command.

use anyhow::Result;

use nbuild_lib::install::ArtifactInstaller;
use nbuild_lib::outdated;

use super::{load_config, load_registry, runtime};
use crate::Settings;
use crate::output::{OutputFormat, print_json, print_success, print_warning, symbols};

/// Compare each project with a repository against its upstream tags.
pub fn cmd_outdated(settings: &Settings, format: OutputFormat) -> Result<u8> {
  let config = load_config(settings, None)?;
  let registry = load_registry(&config)?;
  let installer = ArtifactInstaller::new(&config.install_root);

  let rt = runtime()?;
  let statuses = rt.block_on(outdated::check(&registry, &config.cache_dir, &installer));

  if format.is_json() {
    print_json(&statuses)?;
    return Ok(0);
  }

  let mut outdated = 0;
  for status in &statuses {
    if let Some(error) = &status.error {
      print_warning(&format!("{}: {}", status.name, error));
    } else if status.is_outdated() {
      outdated += 1;
      println!(
        "  {} {} {} {} ({} newer)",
        status.name,
        status.current,
        symbols::ARROW,
        status.latest.as_deref().unwrap_or("?"),
        status.newer.len()
      );
    }
  }

  if outdated == 0 {
    print_success("All projects are up to date");
  }

  Ok(0)
}
