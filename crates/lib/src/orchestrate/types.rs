//! Build states, per-project outcomes and the run summary.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::builder::BuildError;
use crate::fetch::FetchError;
use crate::graph::ResolveError;
use crate::install::InstallError;
use crate::lock::LockError;
use crate::patch::PatchError;
use crate::registry::RegistryError;
use crate::util::hash::HashError;

/// Where a project is in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
  Pending,
  Fetching,
  Patching,
  Building,
  Installing,
  Done,
  Failed { reason: String },
  /// A dependency (named) failed, so this project never started.
  SkippedDueToDependencyFailure { failed: String },
  /// The run was cancelled before this project started.
  Cancelled,
}

impl BuildState {
  fn rank(&self) -> u8 {
    match self {
      BuildState::Pending => 0,
      BuildState::Fetching => 1,
      BuildState::Patching => 2,
      BuildState::Building => 3,
      BuildState::Installing => 4,
      BuildState::Done
      | BuildState::Failed { .. }
      | BuildState::SkippedDueToDependencyFailure { .. }
      | BuildState::Cancelled => 5,
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.rank() == 5
  }

  pub fn is_done(&self) -> bool {
    matches!(self, BuildState::Done)
  }
}

impl fmt::Display for BuildState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildState::Pending => write!(f, "pending"),
      BuildState::Fetching => write!(f, "fetching"),
      BuildState::Patching => write!(f, "patching"),
      BuildState::Building => write!(f, "building"),
      BuildState::Installing => write!(f, "installing"),
      BuildState::Done => write!(f, "done"),
      BuildState::Failed { reason } => write!(f, "failed: {reason}"),
      BuildState::SkippedDueToDependencyFailure { failed } => write!(f, "skipped ({failed} failed)"),
      BuildState::Cancelled => write!(f, "cancelled"),
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("project '{project}' cannot move from {from} to {to}")]
pub struct TransitionError {
  pub project: String,
  pub from: String,
  pub to: String,
}

/// Current state of every project in the run. Transitions only move
/// forward; terminal states are final.
#[derive(Debug, Default)]
pub struct StateTracker {
  states: HashMap<String, BuildState>,
}

impl StateTracker {
  pub fn new<'a>(names: impl IntoIterator<Item = &'a String>) -> Self {
    Self {
      states: names.into_iter().map(|n| (n.clone(), BuildState::Pending)).collect(),
    }
  }

  pub fn get(&self, name: &str) -> Option<&BuildState> {
    self.states.get(name)
  }

  pub fn advance(&mut self, name: &str, next: BuildState) -> Result<(), TransitionError> {
    let current = self.states.entry(name.to_string()).or_insert(BuildState::Pending);
    if current.is_terminal() || next.rank() < current.rank() {
      return Err(TransitionError {
        project: name.to_string(),
        from: current.to_string(),
        to: next.to_string(),
      });
    }
    *current = next;
    Ok(())
  }
}

/// Final record of one project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectReport {
  pub name: String,
  pub state: BuildState,
  /// Resolved version, once known.
  pub version: Option<String>,
  /// Done through the skip path: the installed tree already matched.
  pub up_to_date: bool,
  pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
  /// Resolved build order.
  pub order: Vec<String>,
  /// One report per project, in build order.
  pub projects: Vec<ProjectReport>,
  pub duration_ms: u64,
}

impl RunSummary {
  pub fn get(&self, name: &str) -> Option<&ProjectReport> {
    self.projects.iter().find(|p| p.name == name)
  }

  pub fn state(&self, name: &str) -> Option<&BuildState> {
    self.get(name).map(|p| &p.state)
  }

  pub fn is_success(&self) -> bool {
    self.projects.iter().all(|p| p.state.is_done())
  }

  /// 0 when every project is done, 1 otherwise.
  pub fn exit_code(&self) -> i32 {
    if self.is_success() { 0 } else { 1 }
  }

  pub fn count(&self, predicate: impl Fn(&BuildState) -> bool) -> usize {
    self.projects.iter().filter(|p| predicate(&p.state)).count()
  }
}

pub(crate) fn millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What to build.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
  /// Projects to build with their dependencies; empty means all.
  pub targets: Vec<String>,
  /// Bypass the skip path and re-extract every source.
  pub force: bool,
  /// Bypass the skip path for these projects only.
  pub rebuild: BTreeSet<String>,
}

/// A failure of one project. Its dependents are skipped; other projects
/// carry on.
#[derive(Debug, Error)]
pub enum ProjectError {
  #[error("project '{project}' is being built by another process")]
  Locked {
    project: String,
    #[source]
    source: LockError,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("fetch failed: {0}")]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Patch(#[from] PatchError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error("install failed: {0}")]
  Install(#[from] InstallError),

  #[error("failed to compute fingerprint: {0}")]
  Fingerprint(#[from] HashError),

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  State(#[from] TransitionError),

  #[error("build task aborted: {0}")]
  Task(String),
}

impl ProjectError {
  pub fn is_cancelled(&self) -> bool {
    matches!(
      self,
      ProjectError::Fetch(FetchError::Cancelled)
        | ProjectError::Patch(PatchError::Cancelled)
        | ProjectError::Build(BuildError::Cancelled)
    )
  }
}

/// Errors that stop a run before any project starts.
#[derive(Debug, Error)]
pub enum OrchestrateError {
  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl OrchestrateError {
  pub fn exit_code(&self) -> i32 {
    2
  }
}
