use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::AUTO_VERSION;

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("failed to read recipe file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse recipe file {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("invalid recipe '{name}': {reason}")]
  Invalid { name: String, reason: String },

  #[error("cannot expand '{template}' for version '{version}': {reason}")]
  Template {
    template: String,
    version: String,
    reason: String,
  },
}

/// External build system driving a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainKind {
  Meson,
  Cmake,
  Msbuild,
  Make,
  Script,
}

impl fmt::Display for ToolchainKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ToolchainKind::Meson => "meson",
      ToolchainKind::Cmake => "cmake",
      ToolchainKind::Msbuild => "msbuild",
      ToolchainKind::Make => "make",
      ToolchainKind::Script => "script",
    };
    f.write_str(name)
  }
}

/// A toolchain option value as written in the recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<String>),
}

impl OptionValue {
  /// Single-token rendering used for `-Dkey=value` style flags.
  pub fn render(&self) -> String {
    match self {
      OptionValue::Bool(b) => b.to_string(),
      OptionValue::Int(i) => i.to_string(),
      OptionValue::Str(s) => s.clone(),
      OptionValue::List(items) => items.join(","),
    }
  }

  /// Value as a list of separate arguments.
  pub fn as_list(&self) -> Vec<String> {
    match self {
      OptionValue::List(items) => items.clone(),
      other => vec![other.render()],
    }
  }
}

/// Rules for choosing the newest upstream version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VersionPolicy {
  /// Only versions with an even minor number count as stable.
  pub even_minor: bool,
  /// Ignore versions whose major number exceeds this.
  pub max_major: Option<u64>,
  pub allow_prerelease: bool,
}

/// Extra file copied into the staged tree after the toolchain install step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallMapping {
  /// Path relative to the source root.
  pub from: String,
  /// Directory relative to the install prefix.
  pub to: String,
}

/// Additive environment change applied to the project's lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvPush {
  pub var: String,
  pub value: String,
}

/// Extension points around the toolchain stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
  PreBuild,
  /// Replaces the toolchain's compile stage.
  Build,
  PostBuild,
  /// Runs after the artifact installer succeeded.
  PostInstall,
}

impl fmt::Display for HookPoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      HookPoint::PreBuild => "pre_build",
      HookPoint::Build => "build",
      HookPoint::PostBuild => "post_build",
      HookPoint::PostInstall => "post_install",
    };
    f.write_str(name)
  }
}

/// Declarative hook as written in a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
  pub at: HookPoint,
  #[serde(flatten)]
  pub action: HookAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookAction {
  /// Shell command run in `dir` (relative to the source root).
  Cmd {
    run: String,
    #[serde(default)]
    dir: Option<String>,
  },
  /// Push onto the lane environment for the remaining stages.
  Env { var: String, value: String },
  /// Compile every `<po_dir>/<lang>.po` into `share/locale/<lang>/LC_MESSAGES/<domain>.mo`.
  Msgfmt { po_dir: String, domain: String },
  /// Run a makefile as a code-generation sub-step.
  Make {
    makefile: String,
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    vars: BTreeMap<String, String>,
  },
  /// Copy a file or directory from the source root into the staged tree.
  Copy { from: String, to: String },
}

/// Additions a recipe makes when a build-wide feature is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureOverlay {
  pub dependencies: Vec<String>,
  /// Replace or add options.
  pub options: BTreeMap<String, OptionValue>,
}

/// Declarative description of one buildable library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
  pub name: String,
  pub version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repository: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub integrity_hash: Option<String>,
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(default)]
  pub patches: Vec<String>,
  pub toolchain: ToolchainKind,
  #[serde(default)]
  pub options: BTreeMap<String, OptionValue>,
  #[serde(default)]
  pub version_policy: VersionPolicy,
  #[serde(default)]
  pub install: Vec<InstallMapping>,
  #[serde(default)]
  pub hooks: Vec<HookSpec>,
  #[serde(default)]
  pub env: Vec<EnvPush>,
  /// Overlays keyed by feature name, applied by [`Recipe::with_features`].
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub when: BTreeMap<String, FeatureOverlay>,
}

impl Recipe {
  pub fn is_auto_version(&self) -> bool {
    self.version == AUTO_VERSION
  }

  /// Check the source rules that serde cannot express.
  pub fn validate(&self) -> Result<(), RecipeError> {
    let invalid = |reason: &str| RecipeError::Invalid {
      name: self.name.clone(),
      reason: reason.to_string(),
    };

    if self.name.trim().is_empty() {
      return Err(invalid("name must not be empty"));
    }
    if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
      return Err(invalid("name must be usable as a directory name"));
    }
    if self.version.trim().is_empty() {
      return Err(invalid("version must not be empty"));
    }
    if self.dependencies.iter().any(|d| d == &self.name) {
      return Err(invalid("a project cannot depend on itself"));
    }

    match (&self.archive_url, &self.repository) {
      (None, None) => return Err(invalid("one of archive_url or repository is required")),
      (Some(_), _) => {
        if self.is_auto_version() {
          return Err(invalid("archive sources need an explicit version"));
        }
        match &self.integrity_hash {
          None => return Err(invalid("archive sources need an integrity_hash")),
          Some(hash) if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            return Err(invalid("integrity_hash must be a 64 character SHA-256 hex digest"));
          }
          Some(_) => {}
        }
      }
      (None, Some(_)) => {}
    }

    Ok(())
  }

  /// Fold the overlays of every enabled feature into the recipe, in feature
  /// name order. Overlays of disabled features are dropped.
  pub fn with_features(mut self, features: &BTreeSet<String>) -> Self {
    for (feature, overlay) in std::mem::take(&mut self.when) {
      if !features.contains(&feature) {
        continue;
      }
      for dependency in overlay.dependencies {
        if !self.dependencies.contains(&dependency) {
          self.dependencies.push(dependency);
        }
      }
      self.options.extend(overlay.options);
    }
    self
  }

  /// Expand `{version}`, `{major}` and `{minor}` in the archive URL.
  pub fn archive_url_for(&self, version: &str) -> Result<Option<String>, RecipeError> {
    self
      .archive_url
      .as_deref()
      .map(|template| expand_version_template(template, version))
      .transpose()
  }
}

pub fn expand_version_template(template: &str, version: &str) -> Result<String, RecipeError> {
  let mut parts = version.split('.');
  let major = parts.next().unwrap_or_default();
  let minor = parts.next();

  let error = |reason: &str| RecipeError::Template {
    template: template.to_string(),
    version: version.to_string(),
    reason: reason.to_string(),
  };

  if major.is_empty() {
    return Err(error("version has no major component"));
  }
  let mut out = template.replace("{version}", version).replace("{major}", major);
  if out.contains("{minor}") {
    let minor = minor.ok_or_else(|| error("version has no minor component"))?;
    out = out.replace("{minor}", minor);
  }

  Ok(out)
}
