//! Run configuration.
//!
//! Values are layered: built-in defaults, then `nbuild.toml`, then `NBUILD_*`
//! environment variables. Command-line flags are applied on top by the caller.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::{CONFIG_FILENAME, DEFAULT_FETCH_RETRIES, DEFAULT_RETRY_BACKOFF_MS};
use crate::platform::TargetArch;
use crate::platform::paths;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid value '{value}' for {var}: {reason}")]
  InvalidEnv { var: String, value: String, reason: String },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}

/// Build flavour handed to every toolchain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildConfiguration {
  #[default]
  Release,
  Debug,
}

impl BuildConfiguration {
  pub fn meson_buildtype(&self) -> &'static str {
    match self {
      BuildConfiguration::Release => "release",
      BuildConfiguration::Debug => "debug",
    }
  }

  pub fn cmake_build_type(&self) -> &'static str {
    match self {
      BuildConfiguration::Release => "Release",
      BuildConfiguration::Debug => "Debug",
    }
  }
}

impl FromStr for BuildConfiguration {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "release" => Ok(BuildConfiguration::Release),
      "debug" => Ok(BuildConfiguration::Debug),
      other => Err(format!("unknown configuration '{other}' (expected release or debug)")),
    }
  }
}

/// Program names or paths for every external tool nbuild drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Programs {
  pub meson: String,
  pub ninja: String,
  pub cmake: String,
  pub msbuild: String,
  pub make: String,
  pub patch: String,
  pub msgfmt: String,
}

impl Default for Programs {
  fn default() -> Self {
    Self {
      meson: "meson".to_string(),
      ninja: "ninja".to_string(),
      cmake: "cmake".to_string(),
      msbuild: "msbuild".to_string(),
      make: if cfg!(windows) { "nmake" } else { "make" }.to_string(),
      patch: "patch".to_string(),
      msgfmt: "msgfmt".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  pub install_root: PathBuf,
  pub build_root: PathBuf,
  pub cache_dir: PathBuf,
  pub recipes_dir: PathBuf,
  pub patch_dir: PathBuf,
  pub parallelism: usize,
  pub fetch_retries: u32,
  pub retry_backoff_ms: u64,
  pub configuration: BuildConfiguration,
  pub arch: TargetArch,
  pub programs: Programs,
  /// Build-wide switches (e.g. `gi`) that enable recipe overlays.
  pub features: BTreeSet<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      install_root: paths::default_install_root(),
      build_root: paths::default_build_root(),
      cache_dir: paths::cache_dir(),
      recipes_dir: PathBuf::from("recipes"),
      patch_dir: PathBuf::from("patches"),
      parallelism: num_cpus(),
      fetch_retries: DEFAULT_FETCH_RETRIES,
      retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
      configuration: BuildConfiguration::default(),
      arch: TargetArch::current(),
      programs: Programs::default(),
      features: BTreeSet::new(),
    }
  }
}

/// On-disk form of [`Config`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
  install_root: Option<PathBuf>,
  build_root: Option<PathBuf>,
  cache_dir: Option<PathBuf>,
  recipes_dir: Option<PathBuf>,
  patch_dir: Option<PathBuf>,
  parallelism: Option<usize>,
  fetch_retries: Option<u32>,
  retry_backoff_ms: Option<u64>,
  configuration: Option<BuildConfiguration>,
  arch: Option<TargetArch>,
  programs: Option<ProgramsFile>,
  features: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramsFile {
  meson: Option<String>,
  ninja: Option<String>,
  cmake: Option<String>,
  msbuild: Option<String>,
  make: Option<String>,
  patch: Option<String>,
  msgfmt: Option<String>,
}

impl Config {
  /// Load defaults, then the config file, then environment overrides.
  ///
  /// The file is `explicit` if given, else `$NBUILD_CONFIG`, else
  /// `./nbuild.toml`, else `<config_dir>/nbuild.toml`. A missing implicit file
  /// is not an error.
  pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = Config::default();

    let file = match explicit {
      Some(path) => Some(path.to_path_buf()),
      None => match std::env::var_os("NBUILD_CONFIG") {
        Some(path) => Some(PathBuf::from(path)),
        None => [PathBuf::from(CONFIG_FILENAME), paths::config_dir().join(CONFIG_FILENAME)]
          .into_iter()
          .find(|p| p.is_file()),
      },
    };

    if let Some(path) = file {
      config.apply_file(&path)?;
    }
    config.apply_env()?;
    config.absolutize()?;
    config.validate()?;

    Ok(config)
  }

  /// Parse `nbuild.toml` content read from `path`. Relative paths are resolved
  /// against the directory holding the file.
  pub fn apply_toml(&mut self, content: &str, path: &Path) -> Result<(), ConfigError> {
    let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    let base = path.parent().unwrap_or(Path::new("."));
    let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };

    if let Some(v) = file.install_root {
      self.install_root = resolve(v);
    }
    if let Some(v) = file.build_root {
      self.build_root = resolve(v);
    }
    if let Some(v) = file.cache_dir {
      self.cache_dir = resolve(v);
    }
    if let Some(v) = file.recipes_dir {
      self.recipes_dir = resolve(v);
    }
    if let Some(v) = file.patch_dir {
      self.patch_dir = resolve(v);
    }
    if let Some(v) = file.parallelism {
      self.parallelism = v;
    }
    if let Some(v) = file.fetch_retries {
      self.fetch_retries = v;
    }
    if let Some(v) = file.retry_backoff_ms {
      self.retry_backoff_ms = v;
    }
    if let Some(v) = file.configuration {
      self.configuration = v;
    }
    if let Some(v) = file.arch {
      self.arch = v;
    }
    if let Some(features) = file.features {
      self.features = features.into_iter().collect();
    }
    if let Some(programs) = file.programs {
      let p = &mut self.programs;
      let overrides = [
        (&mut p.meson, programs.meson),
        (&mut p.ninja, programs.ninja),
        (&mut p.cmake, programs.cmake),
        (&mut p.msbuild, programs.msbuild),
        (&mut p.make, programs.make),
        (&mut p.patch, programs.patch),
        (&mut p.msgfmt, programs.msgfmt),
      ];
      for (slot, value) in overrides {
        if let Some(value) = value {
          *slot = value;
        }
      }
    }

    Ok(())
  }

  fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
    debug!(path = %path.display(), "loading config file");
    let path = dunce::canonicalize(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
      path: path.clone(),
      source,
    })?;
    self.apply_toml(&content, &path)
  }

  /// Apply `NBUILD_*` overrides from the process environment.
  pub fn apply_env(&mut self) -> Result<(), ConfigError> {
    if let Some(v) = std::env::var_os("NBUILD_INSTALL_ROOT") {
      self.install_root = PathBuf::from(v);
    }
    if let Some(v) = std::env::var_os("NBUILD_BUILD_ROOT") {
      self.build_root = PathBuf::from(v);
    }
    if let Some(v) = std::env::var_os("NBUILD_CACHE_DIR") {
      self.cache_dir = PathBuf::from(v);
    }
    if let Some(v) = std::env::var_os("NBUILD_RECIPES") {
      self.recipes_dir = PathBuf::from(v);
    }
    if let Some(v) = std::env::var_os("NBUILD_PATCHES") {
      self.patch_dir = PathBuf::from(v);
    }
    if let Some(v) = env_parse::<usize>("NBUILD_JOBS")? {
      self.parallelism = v;
    }
    if let Ok(v) = std::env::var("NBUILD_FEATURES") {
      self.features = parse_features(&v);
    }

    let p = &mut self.programs;
    let overrides = [
      ("NBUILD_MESON", &mut p.meson),
      ("NBUILD_NINJA", &mut p.ninja),
      ("NBUILD_CMAKE", &mut p.cmake),
      ("NBUILD_MSBUILD", &mut p.msbuild),
      ("NBUILD_MAKE", &mut p.make),
      ("NBUILD_PATCH", &mut p.patch),
      ("NBUILD_MSGFMT", &mut p.msgfmt),
    ];
    for (var, slot) in overrides {
      if let Ok(value) = std::env::var(var)
        && !value.is_empty()
      {
        *slot = value;
      }
    }

    Ok(())
  }

  /// Resolve relative directories against the working directory. Toolchains
  /// run from other directories and need absolute prefixes.
  pub fn absolutize(&mut self) -> Result<(), ConfigError> {
    let cwd = std::env::current_dir().map_err(|e| ConfigError::Invalid(format!("no working directory: {e}")))?;
    for dir in [
      &mut self.install_root,
      &mut self.build_root,
      &mut self.cache_dir,
      &mut self.recipes_dir,
      &mut self.patch_dir,
    ] {
      if dir.is_relative() {
        *dir = cwd.join(&*dir);
      }
    }
    Ok(())
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.parallelism == 0 {
      return Err(ConfigError::Invalid("parallelism must be at least 1".to_string()));
    }
    Ok(())
  }

  /// Per-project working directory under the build root.
  pub fn project_dir(&self, name: &str) -> PathBuf {
    self.build_root.join(name)
  }

  pub fn project_lock_path(&self, name: &str) -> PathBuf {
    self.build_root.join(format!("{name}.lock"))
  }
}

/// Comma or whitespace separated feature names.
pub fn parse_features(value: &str) -> BTreeSet<String> {
  value
    .split(|c: char| c == ',' || c.is_whitespace())
    .filter(|f| !f.is_empty())
    .map(str::to_string)
    .collect()
}

fn env_parse<T>(var: &str) -> Result<Option<T>, ConfigError>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match std::env::var(var) {
    Ok(value) if !value.is_empty() => value
      .parse::<T>()
      .map(Some)
      .map_err(|e| ConfigError::InvalidEnv {
        var: var.to_string(),
        value,
        reason: e.to_string(),
      }),
    _ => Ok(None),
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
