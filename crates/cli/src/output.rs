//! CLI output formatting utilities.
//!
//! Colored status lines for build reports, human-readable durations, and JSON
//! output for scripting.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use nbuild_lib::orchestrate::{BuildState, ProjectReport};
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "-";
}

pub fn truncate_hash(hash: &str) -> &str {
  let len = hash.len().min(12);
  &hash[..len]
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// One line per project: symbol, name, version, outcome and duration.
pub fn print_report(report: &ProjectReport) {
  let version = report.version.as_deref().unwrap_or("?");
  let duration = format_duration(Duration::from_millis(report.duration_ms));
  match &report.state {
    BuildState::Done if report.up_to_date => println!(
      "{} {} {} {}",
      symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
      report.name,
      version.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      "(up to date)".if_supports_color(Stream::Stdout, |s| s.dimmed()),
    ),
    BuildState::Done => println!(
      "{} {} {} {}",
      symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
      report.name,
      version.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      duration
    ),
    BuildState::Failed { reason } => {
      println!(
        "{} {} {} {}",
        symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()),
        report.name,
        version.if_supports_color(Stream::Stdout, |s| s.dimmed()),
        "failed".if_supports_color(Stream::Stdout, |s| s.red()),
      );
      for line in reason.lines() {
        println!("    {}", line.if_supports_color(Stream::Stdout, |s| s.dimmed()));
      }
    }
    state => println!(
      "{} {} {}",
      symbols::SKIP.if_supports_color(Stream::Stdout, |s| s.yellow()),
      report.name,
      state.if_supports_color(Stream::Stdout, |s| s.yellow()),
    ),
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
