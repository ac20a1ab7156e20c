//! Registered projects: a recipe plus the strategies selected from it.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::hooks::Hook;
use crate::recipe::{HookPoint, Recipe, RecipeError, ToolchainKind};

/// How a project's source is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
  /// Versioned tarball or zip, verified against a SHA-256 digest.
  Archive { url_template: String, sha256: String },
  /// Git repository checked out at the tag matching the version.
  Git {
    url: String,
    /// Expected commit id (or prefix) of the checked-out tag.
    commit: Option<String>,
  },
}

impl Source {
  pub fn kind(&self) -> &'static str {
    match self {
      Source::Archive { .. } => "archive",
      Source::Git { .. } => "git",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Project {
  pub recipe: Recipe,
  pub source: Source,
  pub toolchain: ToolchainKind,
  pub hooks: Vec<Hook>,
}

impl Project {
  /// Validate a recipe and pick its acquisition strategy.
  ///
  /// An `archive_url` wins over `repository`; the repository then only serves
  /// upstream version listings.
  pub fn from_recipe(recipe: Recipe) -> Result<Self, RecipeError> {
    recipe.validate()?;

    let source = match (&recipe.archive_url, &recipe.repository) {
      (Some(template), _) => Source::Archive {
        url_template: template.clone(),
        sha256: recipe.integrity_hash.clone().unwrap_or_default().to_ascii_lowercase(),
      },
      (None, Some(url)) => Source::Git {
        url: url.clone(),
        commit: recipe.integrity_hash.clone(),
      },
      (None, None) => {
        return Err(RecipeError::Invalid {
          name: recipe.name.clone(),
          reason: "one of archive_url or repository is required".to_string(),
        });
      }
    };

    let hooks = recipe.hooks.iter().cloned().map(Hook::Spec).collect();

    Ok(Self {
      toolchain: recipe.toolchain,
      source,
      hooks,
      recipe,
    })
  }

  pub fn name(&self) -> &str {
    &self.recipe.name
  }

  pub fn dependencies(&self) -> &[String] {
    &self.recipe.dependencies
  }

  /// Append a programmatic hook after the recipe's declarative ones.
  pub fn with_hook(mut self, hook: Hook) -> Self {
    self.hooks.push(hook);
    self
  }

  /// Hooks registered at `point`, in declaration order.
  pub fn hooks_at(&self, point: HookPoint) -> impl Iterator<Item = &Hook> {
    self.hooks.iter().filter(move |h| h.point() == point)
  }
}

/// Working directories of one project under the build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
  pub root: PathBuf,
  /// Extracted or checked-out source tree.
  pub source: PathBuf,
  /// Out-of-tree build directory.
  pub build: PathBuf,
  /// Install prefix handed to the toolchain; copied into the install root afterwards.
  pub stage: PathBuf,
  pub logs: PathBuf,
}

impl ProjectPaths {
  pub fn new(build_root: &Path, name: &str) -> Self {
    let root = build_root.join(name);
    Self {
      source: root.join("src"),
      build: root.join("build"),
      stage: root.join("stage"),
      logs: root.join("logs"),
      root,
    }
  }
}
