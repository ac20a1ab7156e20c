//! The install manifest: which files each project put under the install root.
//!
//! # Storage Layout
//!
//! ```text
//! {install_root}/.nbuild/
//! ├── manifest.json   # Manifest
//! └── manifest.lock   # held while reading-modifying-writing the manifest
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::InstallError;
use crate::consts::{MANIFEST_FILENAME, MANIFEST_LOCK_FILENAME, STATE_DIR};
use crate::lock::{FileLock, LockMode};
use crate::util::hash::Fingerprint;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub version: String,
  pub fingerprint: Fingerprint,
  /// Digest of the archive or commit id the build started from.
  pub source_hash: String,
  /// Paths relative to the install root, `/`-separated.
  pub files: BTreeSet<String>,
  /// RFC 3339 timestamp.
  pub installed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  pub version: u32,
  #[serde(default)]
  pub projects: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
  fn default() -> Self {
    Self {
      version: MANIFEST_VERSION,
      projects: BTreeMap::new(),
    }
  }
}

impl Manifest {
  /// Names of other projects that also list `file`.
  pub fn owners_except<'a>(&'a self, file: &'a str, project: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .projects
      .iter()
      .filter(move |(name, entry)| name.as_str() != project && entry.files.contains(file))
      .map(|(name, _)| name.as_str())
  }
}

/// Reads and atomically rewrites `manifest.json`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
  state_dir: PathBuf,
}

impl ManifestStore {
  pub fn new(install_root: &Path) -> Self {
    Self {
      state_dir: install_root.join(STATE_DIR),
    }
  }

  pub fn path(&self) -> PathBuf {
    self.state_dir.join(MANIFEST_FILENAME)
  }

  fn lock_path(&self) -> PathBuf {
    self.state_dir.join(MANIFEST_LOCK_FILENAME)
  }

  /// Load the manifest; a missing file is an empty manifest.
  pub fn load(&self) -> Result<Manifest, InstallError> {
    let path = self.path();

    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Manifest::default()),
      Err(source) => return Err(InstallError::Io { path, source }),
    };

    let manifest: Manifest =
      serde_json::from_str(&content).map_err(|source| InstallError::ManifestParse { path, source })?;

    if manifest.version != MANIFEST_VERSION {
      return Err(InstallError::UnsupportedVersion(manifest.version));
    }

    Ok(manifest)
  }

  /// Write to a temporary file, then rename over the manifest.
  fn save(&self, manifest: &Manifest) -> Result<(), InstallError> {
    fs::create_dir_all(&self.state_dir).map_err(|source| InstallError::Io {
      path: self.state_dir.clone(),
      source,
    })?;

    let path = self.path();
    let temp_path = self.state_dir.join(format!("{MANIFEST_FILENAME}.tmp"));

    let content = serde_json::to_string_pretty(manifest).map_err(|source| InstallError::ManifestParse {
      path: path.clone(),
      source,
    })?;
    fs::write(&temp_path, &content).map_err(|source| InstallError::Io {
      path: temp_path.clone(),
      source,
    })?;
    fs::rename(&temp_path, &path).map_err(|source| InstallError::Io { path, source })?;

    Ok(())
  }

  /// Load, modify and save the manifest while holding the manifest lock.
  pub fn update<T>(&self, holder: &str, f: impl FnOnce(&mut Manifest) -> Result<T, InstallError>) -> Result<T, InstallError> {
    let _lock = FileLock::acquire_blocking(&self.lock_path(), LockMode::Exclusive, holder)?;
    let mut manifest = self.load()?;
    let result = f(&mut manifest)?;
    self.save(&manifest)?;
    Ok(result)
  }

  /// Read the manifest under a shared lock.
  pub fn read(&self) -> Result<Manifest, InstallError> {
    let _lock = FileLock::acquire_blocking(&self.lock_path(), LockMode::Shared, "manifest read")?;
    self.load()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn entry(files: &[&str]) -> ManifestEntry {
    ManifestEntry {
      version: "1.0".to_string(),
      fingerprint: Fingerprint("abc".to_string()),
      source_hash: "def".to_string(),
      files: files.iter().map(|f| f.to_string()).collect(),
      installed_at: "2024-01-01T00:00:00Z".to_string(),
    }
  }

  #[test]
  fn missing_manifest_is_empty() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(temp.path());
    assert_eq!(store.load().unwrap(), Manifest::default());
  }

  #[test]
  fn update_persists_atomically() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(temp.path());

    store
      .update("test", |m| {
        m.projects.insert("zlib".to_string(), entry(&["lib/z.lib"]));
        Ok(())
      })
      .unwrap();

    assert!(store.path().exists());
    assert!(!temp.path().join(STATE_DIR).join("manifest.json.tmp").exists());
    let loaded = store.read().unwrap();
    assert_eq!(loaded.projects["zlib"].files.len(), 1);
  }

  #[test]
  fn unsupported_version_is_rejected() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(temp.path());
    fs::create_dir_all(temp.path().join(STATE_DIR)).unwrap();
    fs::write(store.path(), r#"{"version": 99, "projects": {}}"#).unwrap();

    assert!(matches!(store.load(), Err(InstallError::UnsupportedVersion(99))));
  }

  #[test]
  fn owners_except_finds_shared_files() {
    let mut manifest = Manifest::default();
    manifest.projects.insert("a".to_string(), entry(&["share/x"]));
    manifest.projects.insert("b".to_string(), entry(&["share/x", "share/y"]));

    let owners: Vec<&str> = manifest.owners_except("share/x", "a").collect();
    assert_eq!(owners, vec!["b"]);
    assert_eq!(manifest.owners_except("share/y", "b").count(), 0);
  }
}
