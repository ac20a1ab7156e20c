//! Implementation of the `nbuild build` command.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use nbuild_lib::orchestrate::{BuildRequest, BuildState, Orchestrator};

use super::{EXIT_FAILED, load_config, load_registry, runtime};
use crate::Settings;
use crate::output::{OutputFormat, format_duration, print_error, print_json, print_report, print_success};

/// Build `projects` (all when empty) and their dependencies.
///
/// Ctrl-C cancels the run: no new project starts and running tools are
/// killed. Returns exit code 1 when any project did not finish.
pub fn cmd_build(
  settings: &Settings,
  projects: Vec<String>,
  force: bool,
  rebuild: Vec<String>,
  jobs: Option<usize>,
  format: OutputFormat,
) -> Result<u8> {
  let config = load_config(settings, jobs)?;
  let registry = load_registry(&config)?;

  let request = BuildRequest {
    targets: projects,
    force,
    rebuild: rebuild.into_iter().collect::<BTreeSet<_>>(),
  };
  let orchestrator = Orchestrator::new(Arc::new(registry), config);

  let rt = runtime()?;
  let summary = rt.block_on(async {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cancelling build");
        on_interrupt.cancel();
      }
    });

    orchestrator.run(&request, cancel).await
  });
  let summary = summary.context("Build could not start")?;

  if format.is_json() {
    print_json(&summary)?;
  } else {
    for report in &summary.projects {
      print_report(report);
    }
    println!();
    let elapsed = format_duration(Duration::from_millis(summary.duration_ms));
    let done = summary.count(BuildState::is_done);
    if summary.is_success() {
      print_success(&format!("{done} project(s) built in {elapsed}"));
    } else {
      print_error(&format!(
        "{} of {} project(s) did not build",
        summary.projects.len() - done,
        summary.projects.len()
      ));
    }
  }

  Ok(if summary.is_success() { 0 } else { EXIT_FAILED })
}
