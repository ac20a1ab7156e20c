mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::{OutputFormat, print_error};

/// nbuild - build native library stacks from source
#[derive(Parser)]
#[command(name = "nbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(flatten)]
  settings: Settings,

  #[command(subcommand)]
  command: Commands,
}

/// Overrides applied on top of the config file and environment.
#[derive(Args, Debug, Default)]
pub struct Settings {
  /// Config file (default: $NBUILD_CONFIG or ./nbuild.toml)
  #[arg(long, global = true, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// Directory the built artifacts are installed into
  #[arg(long, global = true, value_name = "DIR")]
  pub install_root: Option<PathBuf>,

  /// Directory holding recipe files
  #[arg(long, global = true, value_name = "DIR")]
  pub recipes: Option<PathBuf>,

  /// Directory holding patch files
  #[arg(long, global = true, value_name = "DIR")]
  pub patches: Option<PathBuf>,

  /// Enable a build-wide feature such as `gi` (repeatable)
  #[arg(short = 'F', long = "feature", global = true, value_name = "NAME")]
  pub features: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
  /// Build projects and everything they depend on
  Build {
    /// Projects to build (default: every registered project)
    projects: Vec<String>,

    /// Rebuild every project, ignoring up-to-date checks
    #[arg(short, long)]
    force: bool,

    /// Rebuild one project even if it is up to date (repeatable)
    #[arg(long, value_name = "NAME")]
    rebuild: Vec<String>,

    /// Maximum number of projects built at once
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,
  },

  /// Show the build order without doing any work
  Plan {
    /// Projects to plan (default: every registered project)
    projects: Vec<String>,
  },

  /// List registered projects
  List,

  /// Report projects with newer upstream versions
  Outdated,

  /// Show the files a project installed
  Manifest {
    /// Project name
    name: String,
  },

  /// Remove a project's installed files
  Clean {
    /// Project name
    name: String,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let format = cli.output;
  let result = match cli.command {
    Commands::Build {
      projects,
      force,
      rebuild,
      jobs,
    } => cmd::cmd_build(&cli.settings, projects, force, rebuild, jobs, format),
    Commands::Plan { projects } => cmd::cmd_plan(&cli.settings, projects, format),
    Commands::List => cmd::cmd_list(&cli.settings, format),
    Commands::Outdated => cmd::cmd_outdated(&cli.settings, format),
    Commands::Manifest { name } => cmd::cmd_manifest(&cli.settings, &name, format),
    Commands::Clean { name } => cmd::cmd_clean(&cli.settings, &name, format),
  };

  match result {
    Ok(code) => ExitCode::from(code),
    Err(e) => {
      print_error(&format!("{e:#}"));
      ExitCode::from(cmd::EXIT_SETUP)
    }
  }
}
