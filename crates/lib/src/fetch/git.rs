//! Git sources through a local mirror.
//!
//! ```text
//! {cache_dir}/git/{project}/   # bare mirror, fetched with all tags
//! ```
//!
//! Checkouts are cloned from the mirror, never from the network. All
//! functions here block; callers run them on the blocking pool.

use std::fs;
use std::path::{Path, PathBuf};

use gix::remote::Direction;
use gix::remote::fetch::Tags;
use tracing::{debug, info};

use super::FetchError;

fn git_error(url: &str) -> impl Fn(Box<dyn std::error::Error + Send + Sync>) -> FetchError + '_ {
  move |source| FetchError::Git {
    url: url.to_string(),
    source,
  }
}

pub fn mirror_path(cache_dir: &Path, name: &str) -> PathBuf {
  cache_dir.join("git").join(name)
}

/// Clone the mirror on first use, fetch new refs and tags afterwards.
pub fn sync_mirror(name: &str, url: &str, cache_dir: &Path) -> Result<PathBuf, FetchError> {
  let path = mirror_path(cache_dir, name);
  let err = git_error(url);

  if path.join("HEAD").exists() {
    debug!(project = name, path = %path.display(), "updating mirror");
    let repo = gix::open(&path).map_err(|e| err(Box::new(e)))?;
    fetch_updates(&repo, url)?;
    return Ok(path);
  }

  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(|source| FetchError::Io {
      path: parent.to_path_buf(),
      source,
    })?;
  }

  info!(project = name, url, path = %path.display(), "cloning mirror");
  let mut prepared = gix::prepare_clone_bare(url, &path)
    .map_err(|e| err(Box::new(e)))?
    .configure_remote(|remote| Ok(remote.with_fetch_tags(Tags::All)));
  prepared
    .fetch_only(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| err(Box::new(e)))?;

  Ok(path)
}

fn fetch_updates(repo: &gix::Repository, url: &str) -> Result<(), FetchError> {
  let err = git_error(url);

  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or_else(|| err("no remote configured for mirror".into()))?
    .map_err(|e| err(Box::new(e)))?
    .with_fetch_tags(Tags::All);

  remote
    .connect(Direction::Fetch)
    .map_err(|e| err(Box::new(e)))?
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| err(Box::new(e)))?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| err(Box::new(e)))?;

  Ok(())
}

/// Short names of every tag in the repository at `path`.
pub fn list_tags(path: &Path, url: &str) -> Result<Vec<String>, FetchError> {
  let err = git_error(url);
  let repo = gix::open(path).map_err(|e| err(Box::new(e)))?;

  let references = repo.references().map_err(|e| err(Box::new(e)))?;
  let mut tags = Vec::new();
  for reference in references.tags().map_err(|e| err(Box::new(e)))? {
    let reference = reference.map_err(&err)?;
    tags.push(reference.name().shorten().to_string());
  }
  tags.sort();

  Ok(tags)
}

/// Clone `tag` from the mirror into the empty directory `dest`. Returns the
/// checked-out commit id.
pub fn checkout_tag(mirror: &Path, url: &str, tag: &str, dest: &Path) -> Result<String, FetchError> {
  let err = git_error(url);
  let mirror_url = mirror.to_string_lossy().into_owned();

  debug!(tag, dest = %dest.display(), "checking out");
  let mut prepared = gix::prepare_clone(mirror_url.as_str(), dest)
    .map_err(|e| err(Box::new(e)))?
    .with_ref_name(Some(tag))
    .map_err(|e| err(Box::new(e)))?;

  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| err(Box::new(e)))?;

  let (repo, _outcome) = checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| err(Box::new(e)))?;

  let mut head = repo.head().map_err(|e| err(Box::new(e)))?;
  let commit = head.peel_to_commit().map_err(|e| err(Box::new(e)))?;

  Ok(commit.id.to_string())
}

/// Whether `expected` (a full id or a prefix of at least 7 characters) names `commit`.
pub fn commit_matches(commit: &str, expected: &str) -> bool {
  let expected = expected.trim();
  expected.len() >= 7 && commit.to_ascii_lowercase().starts_with(&expected.to_ascii_lowercase())
}
