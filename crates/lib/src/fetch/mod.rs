//! Source acquisition.
//!
//! [`fetch`] turns a project's [`Source`] into an extracted source tree at a
//! destination directory. Archives come from the download cache and are
//! verified before extraction; git sources are checked out from a local
//! mirror at the tag matching the version.
//!
//! # Marker
//!
//! After a successful extraction `.nbuild-source.json` is written next to
//! the destination. It records the version, the source hash and the digests
//! of the patches the tree is meant to carry. When all three match the tree is
//! reused and reported as not fresh, so patches are not applied twice; any
//! change to the patch list or a patch's content forces a fresh extraction.

mod archive;
mod extract;
mod git;
mod version;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::consts::SOURCE_MARKER;
use crate::project::{Project, Source};
use crate::recipe::expand_version_template;

pub use archive::{cache_path, url_to_filename};
pub use extract::{ArchiveFormat, unpack_archive};
pub use git::{commit_matches, list_tags, mirror_path, sync_mirror};
pub use version::{TagVersion, find_pinned, newer_than, parse_tag, parse_version, select_latest};

#[cfg(test)]
pub(crate) use extract::testutil;

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("integrity check failed for {what}: expected {expected}, got {actual}")]
  Integrity {
    what: String,
    expected: String,
    actual: String,
  },

  #[error("download of '{url}' failed after {attempts} attempt(s): {message}")]
  Network { url: String, attempts: u32, message: String },

  #[error("failed to extract '{archive}': {reason}")]
  Extract { archive: PathBuf, reason: String },

  #[error("git operation on '{url}' failed: {source}")]
  Git {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot determine version of '{project}': {reason}")]
  Version { project: String, reason: String },

  #[error("cancelled while fetching")]
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
  pub cache_dir: PathBuf,
  /// Retries after the first failed attempt.
  pub retries: u32,
  /// Delay before the first retry; doubled for every further one.
  pub backoff_ms: u64,
  /// Discard the extracted tree and marker before fetching.
  pub force: bool,
  pub cancel: CancellationToken,
}

impl FetchOptions {
  pub fn from_config(config: &Config, cancel: CancellationToken) -> Self {
    Self {
      cache_dir: config.cache_dir.clone(),
      retries: config.fetch_retries,
      backoff_ms: config.retry_backoff_ms,
      force: false,
      cancel,
    }
  }

  pub fn with_force(mut self, force: bool) -> Self {
    self.force = force;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
  pub source_root: PathBuf,
  /// True when the tree was extracted by this call.
  pub fresh: bool,
  pub version: String,
  /// Archive digest or commit id.
  pub source_hash: String,
}

/// The version to build, plus the upstream tags listed while resolving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
  pub version: String,
  /// Set for `auto` versions so [`fetch`] does not sync the mirror again.
  pub tags: Option<Vec<String>>,
}

impl ResolvedVersion {
  pub fn pinned(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
      tags: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SourceMarker {
  version: String,
  source_hash: String,
  /// Digests of the patches applied on top of the extracted tree.
  #[serde(default)]
  patches: Vec<String>,
}

fn marker_path(dest: &Path) -> PathBuf {
  match dest.parent() {
    Some(parent) => parent.join(SOURCE_MARKER),
    None => dest.join(SOURCE_MARKER),
  }
}

fn read_marker(dest: &Path) -> Option<SourceMarker> {
  if !dest.is_dir() {
    return None;
  }
  let content = fs::read_to_string(marker_path(dest)).ok()?;
  serde_json::from_str(&content).ok()
}

fn write_marker(dest: &Path, marker: &SourceMarker) -> Result<(), FetchError> {
  let path = marker_path(dest);
  let content = serde_json::to_string_pretty(marker).map_err(|e| FetchError::Io {
    path: path.clone(),
    source: io::Error::other(e),
  })?;
  fs::write(&path, content).map_err(|source| FetchError::Io { path, source })
}

fn remove_marker(dest: &Path) -> Result<(), FetchError> {
  let path = marker_path(dest);
  match fs::remove_file(&path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(source) => Err(FetchError::Io { path, source }),
  }
}

fn remove_tree(dest: &Path) -> Result<(), FetchError> {
  match fs::remove_dir_all(dest) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(source) => Err(FetchError::Io {
      path: dest.to_path_buf(),
      source,
    }),
  }
}

async fn blocking<T: Send + 'static>(
  f: impl FnOnce() -> Result<T, FetchError> + Send + 'static,
) -> Result<T, FetchError> {
  tokio::task::spawn_blocking(f).await.map_err(|e| FetchError::Io {
    path: PathBuf::new(),
    source: io::Error::other(e),
  })?
}

/// Fill a fresh temporary sibling of `dest` with `fill`, then move it into
/// place, replacing whatever was there. The marker is removed first so an
/// interrupted swap never looks complete.
fn replace_tree(dest: &Path, fill: impl FnOnce(&Path) -> Result<String, FetchError>) -> Result<String, FetchError> {
  let parent = dest.parent().unwrap_or(dest);
  fs::create_dir_all(parent).map_err(|source| FetchError::Io {
    path: parent.to_path_buf(),
    source,
  })?;

  let staging = tempfile::Builder::new()
    .prefix(".extract-")
    .tempdir_in(parent)
    .map_err(|source| FetchError::Io {
      path: parent.to_path_buf(),
      source,
    })?;
  let result = fill(staging.path())?;

  remove_marker(dest)?;
  remove_tree(dest)?;
  fs::rename(staging.path(), dest).map_err(|source| FetchError::Io {
    path: dest.to_path_buf(),
    source,
  })?;

  Ok(result)
}

/// Forget the extracted tree at `dest`, so the next [`fetch`] extracts afresh.
pub fn invalidate(dest: &Path) -> Result<(), FetchError> {
  remove_marker(dest)
}

/// Determine the version to build.
///
/// Pinned versions are returned as they are. `"auto"` syncs the project's
/// mirror and picks the highest tag admitted by the version policy.
pub async fn resolve_version(project: &Project, opts: &FetchOptions) -> Result<ResolvedVersion, FetchError> {
  if !project.recipe.is_auto_version() {
    return Ok(ResolvedVersion::pinned(&project.recipe.version));
  }

  let Source::Git { url, .. } = &project.source else {
    return Err(FetchError::Version {
      project: project.name().to_string(),
      reason: "\"auto\" needs a repository".to_string(),
    });
  };

  let tags = upstream_tags(project.name(), url, &opts.cache_dir).await?;
  let policy = &project.recipe.version_policy;
  let latest = select_latest(tags.iter().map(String::as_str), policy).ok_or_else(|| FetchError::Version {
    project: project.name().to_string(),
    reason: format!("no tag of {url} qualifies under {policy:?}"),
  })?;

  info!(project = %project.name(), version = %latest.version, tag = %latest.tag, "resolved version");
  Ok(ResolvedVersion {
    version: latest.version,
    tags: Some(tags),
  })
}

/// Sync the mirror of `url` and list its tags.
pub async fn upstream_tags(name: &str, url: &str, cache_dir: &Path) -> Result<Vec<String>, FetchError> {
  let (name, url, cache_dir) = (name.to_string(), url.to_string(), cache_dir.to_path_buf());
  blocking(move || {
    let mirror = sync_mirror(&name, &url, &cache_dir)?;
    list_tags(&mirror, &url)
  })
  .await
}

/// Acquire `project`'s source at the resolved version into `dest`.
///
/// `patches` are the digests of the patches the caller applies to a fresh
/// tree; an existing tree is only reused when it was extracted for the same
/// list.
pub async fn fetch(
  project: &Project,
  resolved: &ResolvedVersion,
  patches: &[String],
  dest: &Path,
  opts: &FetchOptions,
) -> Result<FetchOutcome, FetchError> {
  let version = resolved.version.as_str();
  if opts.cancel.is_cancelled() {
    return Err(FetchError::Cancelled);
  }

  if opts.force {
    debug!(project = %project.name(), "discarding extracted source");
    remove_marker(dest)?;
    remove_tree(dest)?;
  }

  let marker = read_marker(dest).filter(|m| m.version == version && m.patches == patches);

  match &project.source {
    Source::Archive { url_template, sha256 } => {
      if let Some(marker) = marker.filter(|m| m.source_hash == *sha256) {
        debug!(project = %project.name(), version, "source already extracted");
        return Ok(not_fresh(dest, marker));
      }

      let url = expand_version_template(url_template, version).map_err(|e| FetchError::Version {
        project: project.name().to_string(),
        reason: e.to_string(),
      })?;
      let archive = archive::obtain(&url, sha256, opts).await?;

      info!(project = %project.name(), archive = %archive.display(), "extracting");
      let dest_owned = dest.to_path_buf();
      let sha = sha256.clone();
      let source_hash = blocking(move || replace_tree(&dest_owned, |tmp| unpack_archive(&archive, tmp).map(|_| sha))).await?;

      finish(dest, version, source_hash, patches)
    }

    Source::Git { url, commit } => {
      let expected = commit.as_deref();
      if let Some(marker) = marker.filter(|m| expected.is_none_or(|c| commit_matches(&m.source_hash, c))) {
        debug!(project = %project.name(), version, "source already checked out");
        return Ok(not_fresh(dest, marker));
      }

      let tags = match &resolved.tags {
        Some(tags) => tags.clone(),
        None => upstream_tags(project.name(), url, &opts.cache_dir).await?,
      };
      let tag = find_pinned(tags.iter().map(String::as_str), version).ok_or_else(|| FetchError::Version {
        project: project.name().to_string(),
        reason: format!("no tag of {url} matches version {version}"),
      })?;

      info!(project = %project.name(), tag = %tag, "checking out");
      let mirror = mirror_path(&opts.cache_dir, project.name());
      let (dest_owned, url_owned) = (dest.to_path_buf(), url.clone());
      let expected_owned = expected.map(str::to_string);
      let commit_id = blocking(move || {
        replace_tree(&dest_owned, |tmp| {
          let id = git::checkout_tag(&mirror, &url_owned, &tag, tmp)?;
          if let Some(expected) = expected_owned
            && !commit_matches(&id, &expected)
          {
            return Err(FetchError::Integrity {
              what: format!("{url_owned}@{tag}"),
              expected,
              actual: id,
            });
          }
          Ok(id)
        })
      })
      .await?;

      finish(dest, version, commit_id, patches)
    }
  }
}

fn not_fresh(dest: &Path, marker: SourceMarker) -> FetchOutcome {
  FetchOutcome {
    source_root: dest.to_path_buf(),
    fresh: false,
    version: marker.version,
    source_hash: marker.source_hash,
  }
}

fn finish(dest: &Path, version: &str, source_hash: String, patches: &[String]) -> Result<FetchOutcome, FetchError> {
  let marker = SourceMarker {
    version: version.to_string(),
    source_hash,
    patches: patches.to_vec(),
  };
  write_marker(dest, &marker)?;

  Ok(FetchOutcome {
    source_root: dest.to_path_buf(),
    fresh: true,
    version: marker.version,
    source_hash: marker.source_hash,
  })
}

#[cfg(test)]
mod tests {
  use super::testutil::tar_gz;
  use super::*;
  use crate::recipe::Recipe;
  use crate::util::hash::hash_bytes;
  use reqwest::Url;
  use tempfile::TempDir;

  struct Fixture {
    temp: TempDir,
    archive: PathBuf,
    sha256: String,
  }

  impl Fixture {
    fn new() -> Self {
      let temp = TempDir::new().unwrap();
      let mirror = temp.path().join("mirror");
      fs::create_dir_all(&mirror).unwrap();
      let archive = mirror.join("zlib-1.3.tar.gz");
      let bytes = tar_gz(&[("zlib-1.3/zlib.h", "#define ZLIB_VERSION \"1.3\"")]);
      fs::write(&archive, &bytes).unwrap();
      Self {
        sha256: hash_bytes(&bytes).0,
        archive,
        temp,
      }
    }

    fn project(&self, sha256: &str) -> Project {
      let mirror = Url::from_directory_path(self.archive.parent().unwrap()).unwrap();
      let recipe: Recipe = toml::from_str(&format!(
        r#"
name = "zlib"
version = "1.3"
archive_url = "{mirror}zlib-{{version}}.tar.gz"
integrity_hash = "{sha256}"
toolchain = "script"
"#
      ))
      .unwrap();
      Project::from_recipe(recipe).unwrap()
    }

    fn options(&self) -> FetchOptions {
      FetchOptions {
        cache_dir: self.temp.path().join("cache"),
        retries: 0,
        backoff_ms: 1,
        force: false,
        cancel: CancellationToken::new(),
      }
    }

    fn dest(&self) -> PathBuf {
      self.temp.path().join("build/zlib/src")
    }
  }

  fn pinned() -> ResolvedVersion {
    ResolvedVersion::pinned("1.3")
  }

  #[tokio::test]
  async fn archive_is_extracted_once() {
    let f = Fixture::new();
    let project = f.project(&f.sha256);

    let first = fetch(&project, &pinned(), &[], &f.dest(), &f.options()).await.unwrap();
    assert!(first.fresh);
    assert_eq!(first.source_hash, f.sha256);
    assert!(f.dest().join("zlib.h").is_file());
    assert!(f.temp.path().join("build/zlib").join(SOURCE_MARKER).is_file());

    fs::write(f.dest().join("patched.txt"), "kept").unwrap();
    let second = fetch(&project, &pinned(), &[], &f.dest(), &f.options()).await.unwrap();
    assert!(!second.fresh);
    assert!(f.dest().join("patched.txt").exists());
  }

  #[tokio::test]
  async fn force_re_extracts() {
    let f = Fixture::new();
    let project = f.project(&f.sha256);
    fetch(&project, &pinned(), &[], &f.dest(), &f.options()).await.unwrap();
    fs::write(f.dest().join("patched.txt"), "stale").unwrap();

    let outcome = fetch(&project, &pinned(), &[], &f.dest(), &f.options().with_force(true))
      .await
      .unwrap();
    assert!(outcome.fresh);
    assert!(!f.dest().join("patched.txt").exists());
    assert!(f.dest().join("zlib.h").is_file());
  }

  #[tokio::test]
  async fn corrupted_archive_extracts_nothing() {
    let f = Fixture::new();
    let mut bytes = fs::read(&f.archive).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&f.archive, &bytes).unwrap();
    let project = f.project(&f.sha256);

    let err = fetch(&project, &pinned(), &[], &f.dest(), &f.options()).await.unwrap_err();
    assert!(matches!(err, FetchError::Integrity { .. }));
    assert!(!f.dest().exists());
    assert!(!cache_path(&f.options().cache_dir, &f.sha256, "zlib-1.3.tar.gz").exists());
  }

  #[tokio::test]
  async fn changed_version_re_extracts() {
    let f = Fixture::new();
    let project = f.project(&f.sha256);
    fetch(&project, &pinned(), &[], &f.dest(), &f.options()).await.unwrap();

    let marker: SourceMarker =
      serde_json::from_str(&fs::read_to_string(marker_path(&f.dest())).unwrap()).unwrap();
    assert_eq!(marker.version, "1.3");

    fs::write(
      marker_path(&f.dest()),
      r#"{"version": "1.2", "source_hash": "old"}"#,
    )
    .unwrap();
    let outcome = fetch(&project, &pinned(), &[], &f.dest(), &f.options()).await.unwrap();
    assert!(outcome.fresh);
  }

  #[tokio::test]
  async fn changed_patch_list_re_extracts() {
    let f = Fixture::new();
    let project = f.project(&f.sha256);
    let one = vec!["d1".to_string()];
    let two = vec!["d1".to_string(), "d2".to_string()];

    let first = fetch(&project, &pinned(), &one, &f.dest(), &f.options()).await.unwrap();
    assert!(first.fresh);
    fs::write(f.dest().join("patched.txt"), "d1 applied").unwrap();

    let same = fetch(&project, &pinned(), &one, &f.dest(), &f.options()).await.unwrap();
    assert!(!same.fresh);

    let grown = fetch(&project, &pinned(), &two, &f.dest(), &f.options()).await.unwrap();
    assert!(grown.fresh);
    assert!(!f.dest().join("patched.txt").exists());

    let marker: SourceMarker =
      serde_json::from_str(&fs::read_to_string(marker_path(&f.dest())).unwrap()).unwrap();
    assert_eq!(marker.patches, two);
  }

  #[tokio::test]
  async fn resolved_tags_are_reused_for_checkout() {
    let f = Fixture::new();
    let recipe: Recipe = toml::from_str(
      r#"
name = "glib"
version = "auto"
repository = "file:///nonexistent/glib.git"
toolchain = "meson"
"#,
    )
    .unwrap();
    let project = Project::from_recipe(recipe).unwrap();
    let resolved = ResolvedVersion {
      version: "2.80.0".to_string(),
      tags: Some(vec!["2.78.4".to_string()]),
    };

    // No mirror sync: the version is looked up in the tags already listed.
    let err = fetch(&project, &resolved, &[], &f.temp.path().join("build/glib/src"), &f.options())
      .await
      .unwrap_err();
    match err {
      FetchError::Version { reason, .. } => assert!(reason.contains("2.80.0"), "{reason}"),
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[tokio::test]
  async fn pinned_versions_resolve_without_network() {
    let f = Fixture::new();
    let project = f.project(&f.sha256);
    assert_eq!(resolve_version(&project, &f.options()).await.unwrap(), pinned());
  }

  #[tokio::test]
  async fn cancelled_before_start() {
    let f = Fixture::new();
    let project = f.project(&f.sha256);
    let opts = f.options();
    opts.cancel.cancel();

    let err = fetch(&project, &pinned(), &[], &f.dest(), &opts).await.unwrap_err();
    assert!(matches!(err, FetchError::Cancelled));
  }
}
