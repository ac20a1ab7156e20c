//! Implementation of the `nbuild plan` command.
//!
//! Resolves the build order for the requested projects and prints it grouped
//! into waves of projects that could build side by side. Nothing is fetched.

use anyhow::{Context, Result};
use serde::Serialize;

use nbuild_lib::graph::DependencyGraph;

use super::{load_config, load_registry};
use crate::Settings;
use crate::output::{OutputFormat, print_json, print_stat, symbols};

#[derive(Serialize)]
struct Plan {
  order: Vec<String>,
  waves: Vec<Vec<String>>,
}

pub fn cmd_plan(settings: &Settings, projects: Vec<String>, format: OutputFormat) -> Result<u8> {
  let config = load_config(settings, None)?;
  let registry = load_registry(&config)?;
  registry.validate().context("Invalid project registry")?;

  let graph = DependencyGraph::new(&registry);
  let order = graph.order(&projects).context("Failed to resolve build order")?;
  let waves = graph.waves(&projects).context("Failed to resolve build order")?;

  if format.is_json() {
    print_json(&Plan { order, waves })?;
    return Ok(0);
  }

  println!("Build order:");
  for (i, name) in order.iter().enumerate() {
    let project = registry.resolve(name)?;
    println!(
      "  {:>3}. {} {} ({})",
      i + 1,
      name,
      project.recipe.version,
      project.toolchain
    );
  }
  println!();
  println!("Waves:");
  for (i, wave) in waves.iter().enumerate() {
    println!("  {} {}: {}", symbols::ARROW, i + 1, wave.join(", "));
  }
  println!();
  print_stat("Projects", &order.len().to_string());
  print_stat("Install root", &config.install_root.display().to_string());

  Ok(0)
}
