//! Build context: the run-wide environment seed and per-project overlays.
//!
//! [`BuildContext`] is created once per run from a snapshot of the process
//! environment and never changes afterwards. Each project gets its own
//! [`BuildEnv`] lane seeded from it; pushes onto a lane are visible only to that
//! project's processes and disappear with the lane.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{BuildConfiguration, Config, Programs};
use crate::platform::{TargetArch, path_list_separator};

/// Search-path variables seeded with install-root subdirectories.
const SEARCH_PATH_SEEDS: [(&str, &str); 7] = [
  ("PATH", "bin"),
  ("INCLUDE", "include"),
  ("LIB", "lib"),
  ("CPATH", "include"),
  ("LIBRARY_PATH", "lib"),
  ("PKG_CONFIG_PATH", "lib/pkgconfig"),
  ("XDG_DATA_DIRS", "share"),
];

/// Immutable, run-wide build settings shared by every lane.
#[derive(Debug)]
pub struct BuildContext {
  base_env: Arc<BTreeMap<String, String>>,
  install_root: PathBuf,
  programs: Programs,
  configuration: BuildConfiguration,
  arch: TargetArch,
  parallelism: usize,
}

impl BuildContext {
  /// Snapshot the process environment once.
  pub fn from_config(config: &Config) -> Self {
    Self::with_base_env(config, std::env::vars())
  }

  pub fn with_base_env(config: &Config, env: impl IntoIterator<Item = (String, String)>) -> Self {
    let base_env = env.into_iter().map(|(k, v)| (normalize_var(&k), v)).collect();
    Self {
      base_env: Arc::new(base_env),
      install_root: config.install_root.clone(),
      programs: config.programs.clone(),
      configuration: config.configuration,
      arch: config.arch,
      parallelism: config.parallelism,
    }
  }

  /// A fresh lane: the base environment plus install-root search paths.
  pub fn lane(&self) -> BuildEnv {
    let mut env = BuildEnv {
      base: Arc::clone(&self.base_env),
      overlay: Vec::new(),
    };
    for (var, sub) in SEARCH_PATH_SEEDS {
      env.push(var, self.install_root.join(sub).to_string_lossy());
    }
    env
  }

  pub fn install_root(&self) -> &Path {
    &self.install_root
  }

  pub fn programs(&self) -> &Programs {
    &self.programs
  }

  pub fn configuration(&self) -> BuildConfiguration {
    self.configuration
  }

  pub fn arch(&self) -> TargetArch {
    self.arch
  }

  pub fn parallelism(&self) -> usize {
    self.parallelism
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Overlay {
  Prepend { var: String, value: String },
  Set { var: String, value: String },
}

/// Position in a lane's overlay stack, see [`BuildEnv::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMark(usize);

/// Layered environment of one project.
///
/// Nothing touches the real process environment; [`BuildEnv::materialize`]
/// produces the map handed to a spawned command.
#[derive(Debug, Clone)]
pub struct BuildEnv {
  base: Arc<BTreeMap<String, String>>,
  overlay: Vec<Overlay>,
}

impl BuildEnv {
  /// A lane with no base environment.
  pub fn empty() -> Self {
    Self {
      base: Arc::new(BTreeMap::new()),
      overlay: Vec::new(),
    }
  }

  /// Prepend `value` to a list variable.
  pub fn push(&mut self, var: &str, value: impl Into<String>) {
    self.overlay.push(Overlay::Prepend {
      var: normalize_var(var),
      value: value.into(),
    });
  }

  /// Replace a variable's value.
  pub fn set(&mut self, var: &str, value: impl Into<String>) {
    self.overlay.push(Overlay::Set {
      var: normalize_var(var),
      value: value.into(),
    });
  }

  /// Undo the most recent `push` or `set`. Returns the variable name.
  pub fn pop(&mut self) -> Option<String> {
    self.overlay.pop().map(|entry| match entry {
      Overlay::Prepend { var, .. } | Overlay::Set { var, .. } => var,
    })
  }

  pub fn mark(&self) -> EnvMark {
    EnvMark(self.overlay.len())
  }

  /// Drop every change made after `mark`.
  pub fn restore(&mut self, mark: EnvMark) {
    self.overlay.truncate(mark.0);
  }

  pub fn depth(&self) -> usize {
    self.overlay.len()
  }

  pub fn get(&self, var: &str) -> Option<String> {
    let var = normalize_var(var);
    let mut value = self.base.get(&var).cloned();
    for entry in &self.overlay {
      apply(entry, &var, &mut value);
    }
    value
  }

  /// The complete environment for a spawned process.
  pub fn materialize(&self) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = (*self.base).clone();
    for entry in &self.overlay {
      let var = match entry {
        Overlay::Prepend { var, .. } | Overlay::Set { var, .. } => var,
      };
      let mut value = env.remove(var);
      apply(entry, var, &mut value);
      if let Some(value) = value {
        env.insert(var.clone(), value);
      }
    }
    env
  }
}

fn apply(entry: &Overlay, var: &str, current: &mut Option<String>) {
  match entry {
    Overlay::Prepend { var: v, value } if v == var => {
      *current = Some(match current.take() {
        Some(existing) if !existing.is_empty() => format!("{value}{}{existing}", path_list_separator()),
        _ => value.clone(),
      });
    }
    Overlay::Set { var: v, value } if v == var => {
      *current = Some(value.clone());
    }
    _ => {}
  }
}

/// Windows treats variable names case-insensitively.
fn normalize_var(var: &str) -> String {
  if cfg!(windows) {
    var.to_ascii_uppercase()
  } else {
    var.to_string()
  }
}
