//! Implementation of the `nbuild list` command.

use anyhow::Result;
use serde_json::json;

use super::{load_config, load_registry};
use crate::Settings;
use crate::output::{OutputFormat, print_info, print_json, symbols};

/// Print registered projects in registration order.
pub fn cmd_list(settings: &Settings, format: OutputFormat) -> Result<u8> {
  let config = load_config(settings, None)?;
  let registry = load_registry(&config)?;

  if format.is_json() {
    let items: Vec<_> = registry
      .all()
      .iter()
      .map(|p| {
        json!({
          "name": p.name(),
          "version": p.recipe.version,
          "toolchain": p.toolchain,
          "source": p.source,
          "dependencies": p.dependencies(),
        })
      })
      .collect();
    print_json(&items)?;
    return Ok(0);
  }

  if registry.is_empty() {
    print_info(&format!("No recipes found in {}", config.recipes_dir.display()));
    return Ok(0);
  }

  for project in registry.all() {
    let deps = project.dependencies();
    if deps.is_empty() {
      println!("  {} {} {}", symbols::INFO, project.name(), project.recipe.version);
    } else {
      println!(
        "  {} {} {} {} {}",
        symbols::INFO,
        project.name(),
        project.recipe.version,
        symbols::ARROW,
        deps.join(", ")
      );
    }
  }

  Ok(0)
}
