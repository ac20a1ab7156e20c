//! Upstream version report.
//!
//! For every project with a `repository`, the mirror is synced and its tags
//! are compared with the pinned version (or, for `"auto"` projects, the
//! installed one) under the project's version policy.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::fetch::{newer_than, select_latest, upstream_tags};
use crate::install::ArtifactInstaller;
use crate::recipe::VersionPolicy;
use crate::registry::ProjectRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamStatus {
  pub name: String,
  /// Pinned or installed version; `auto` when an auto project is not installed.
  pub current: String,
  /// Highest qualifying upstream version.
  pub latest: Option<String>,
  /// Qualifying versions newer than `current`, ascending.
  pub newer: Vec<String>,
  /// Set when the upstream listing could not be read.
  pub error: Option<String>,
}

impl UpstreamStatus {
  pub fn is_outdated(&self) -> bool {
    !self.newer.is_empty()
  }
}

/// Compare `current` with an upstream tag listing.
pub fn compare(name: &str, current: &str, tags: &[String], policy: &VersionPolicy) -> UpstreamStatus {
  let tags = || tags.iter().map(String::as_str);
  UpstreamStatus {
    name: name.to_string(),
    current: current.to_string(),
    latest: select_latest(tags(), policy).map(|t| t.version),
    newer: newer_than(current, tags(), policy).into_iter().map(|t| t.version).collect(),
    error: None,
  }
}

/// Check every project with a repository, in registration order.
pub async fn check(registry: &ProjectRegistry, cache_dir: &Path, installer: &ArtifactInstaller) -> Vec<UpstreamStatus> {
  let mut statuses = Vec::new();

  for project in registry.all() {
    let Some(url) = project.recipe.repository.as_deref() else {
      debug!(project = %project.name(), "no repository, skipped");
      continue;
    };

    let current = if project.recipe.is_auto_version() {
      match installer.entry(project.name()) {
        Ok(Some(entry)) => entry.version,
        Ok(None) => project.recipe.version.clone(),
        Err(e) => {
          warn!(project = %project.name(), error = %e, "cannot read manifest");
          project.recipe.version.clone()
        }
      }
    } else {
      project.recipe.version.clone()
    };

    let status = match upstream_tags(project.name(), url, cache_dir).await {
      Ok(tags) => compare(project.name(), &current, &tags, &project.recipe.version_policy),
      Err(e) => {
        warn!(project = %project.name(), url, error = %e, "upstream listing failed");
        UpstreamStatus {
          name: project.name().to_string(),
          current,
          latest: None,
          newer: Vec::new(),
          error: Some(e.to_string()),
        }
      }
    };
    statuses.push(status);
  }

  statuses
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tags(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
  }

  #[test]
  fn even_minor_policy_for_stable_series() {
    let policy = VersionPolicy {
      even_minor: true,
      max_major: Some(3),
      allow_prerelease: false,
    };
    let status = compare(
      "gtk3",
      "3.24.41",
      &tags(&["3.24.41", "3.24.42", "3.25.1", "4.14.0"]),
      &policy,
    );

    assert!(status.is_outdated());
    assert_eq!(status.latest.as_deref(), Some("3.24.42"));
    assert_eq!(status.newer, vec!["3.24.42"]);
  }

  #[test]
  fn up_to_date_project() {
    let status = compare("cairo", "1.18.0", &tags(&["1.16.0", "1.18.0"]), &VersionPolicy::default());
    assert!(!status.is_outdated());
    assert_eq!(status.latest.as_deref(), Some("1.18.0"));
  }

  #[test]
  fn auto_projects_not_installed_list_everything_as_latest() {
    let status = compare("glib", "auto", &tags(&["2.78.0", "2.80.0"]), &VersionPolicy::default());
    assert_eq!(status.latest.as_deref(), Some("2.80.0"));
    assert!(status.newer.is_empty());
  }
}
