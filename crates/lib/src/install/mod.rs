//! Artifact installer.
//!
//! Copies a project's staged tree into the shared install root and records
//! every file it wrote in the manifest. Re-installing a project replaces only
//! that project's entry and deletes files it no longer produces. Files staged
//! by `post_install` hooks are added to the entry afterwards with
//! [`ArtifactInstaller::install_extra`].

mod manifest;

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use manifest::{MANIFEST_VERSION, Manifest, ManifestEntry, ManifestStore};

use crate::lock::LockError;
use crate::util::hash::Fingerprint;

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("install source {path} does not exist")]
  MissingSource { path: PathBuf },

  #[error("failed to copy {from} to {to}: {source}")]
  Copy {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid manifest {path}: {source}")]
  ManifestParse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported manifest version {0}")]
  UnsupportedVersion(u32),

  #[error("project '{0}' is not installed")]
  NotInstalled(String),

  #[error(transparent)]
  Lock(#[from] LockError),
}

/// Copy `src` into the directory `dest_dir`.
///
/// A file lands at `dest_dir/<file name>`; a directory is copied recursively
/// to `dest_dir/<dir name>/`. Returns the files written.
pub fn copy_into(src: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, InstallError> {
  if !src.exists() {
    return Err(InstallError::MissingSource { path: src.to_path_buf() });
  }
  let Some(name) = src.file_name() else {
    return Err(InstallError::MissingSource { path: src.to_path_buf() });
  };
  let target = dest_dir.join(name);

  if src.is_file() {
    copy_file(src, &target)?;
    return Ok(vec![target]);
  }

  let mut written = Vec::new();
  for (from, rel) in walk_files(src)? {
    let to = target.join(rel);
    copy_file(&from, &to)?;
    written.push(to);
  }
  Ok(written)
}

fn copy_file(from: &Path, to: &Path) -> Result<(), InstallError> {
  if let Some(parent) = to.parent() {
    fs::create_dir_all(parent).map_err(|source| InstallError::Io {
      path: parent.to_path_buf(),
      source,
    })?;
  }
  fs::copy(from, to).map_err(|source| InstallError::Copy {
    from: from.to_path_buf(),
    to: to.to_path_buf(),
    source,
  })?;
  Ok(())
}

/// Every regular file below `root`, sorted, with its `/`-separated relative path.
fn walk_files(root: &Path) -> Result<Vec<(PathBuf, String)>, InstallError> {
  let mut files = Vec::new();
  for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
    let entry = entry.map_err(|e| InstallError::Io {
      path: root.to_path_buf(),
      source: e.into(),
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    let rel = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .components()
      .map(|c| c.as_os_str().to_string_lossy().into_owned())
      .collect::<Vec<_>>()
      .join("/");
    files.push((entry.into_path(), rel));
  }
  Ok(files)
}

/// Identity recorded alongside the installed files.
#[derive(Debug, Clone)]
pub struct InstallRecord {
  pub version: String,
  pub fingerprint: Fingerprint,
  pub source_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub installed: usize,
  pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactInstaller {
  install_root: PathBuf,
  store: ManifestStore,
}

impl ArtifactInstaller {
  pub fn new(install_root: impl Into<PathBuf>) -> Self {
    let install_root = install_root.into();
    Self {
      store: ManifestStore::new(&install_root),
      install_root,
    }
  }

  pub fn install_root(&self) -> &Path {
    &self.install_root
  }

  /// Copy the staged tree of `project` into the install root and replace its
  /// manifest entry.
  ///
  /// pkg-config files are rewritten so their prefix points at the install root
  /// rather than the staging directory.
  pub fn install(&self, project: &str, stage_dir: &Path, record: InstallRecord) -> Result<InstallReport, InstallError> {
    if !stage_dir.is_dir() {
      return Err(InstallError::MissingSource {
        path: stage_dir.to_path_buf(),
      });
    }

    let files = self.copy_stage(stage_dir)?;
    debug!(project, files = files.len(), "copied staged files");

    let removed = self.store.update(&format!("install {project}"), |manifest| {
      let mut removed = 0;
      if let Some(previous) = manifest.projects.get(project) {
        for stale in previous.files.difference(&files) {
          if manifest.owners_except(stale, project).next().is_some() {
            continue;
          }
          if remove_file(&self.install_root.join(stale))? {
            removed += 1;
          }
        }
      }

      manifest.projects.insert(
        project.to_string(),
        ManifestEntry {
          version: record.version,
          fingerprint: record.fingerprint,
          source_hash: record.source_hash,
          files: files.clone(),
          installed_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
        },
      );
      Ok(removed)
    })?;

    info!(project, installed = files.len(), removed, "installed");
    Ok(InstallReport {
      installed: files.len(),
      removed,
    })
  }

  /// Copy files staged after the main install (by `post_install` hooks) into
  /// the install root and add them to the existing entry of `project`.
  /// Nothing is removed. Returns how many files were copied.
  pub fn install_extra(&self, project: &str, stage_dir: &Path) -> Result<usize, InstallError> {
    if !stage_dir.is_dir() {
      return Ok(0);
    }
    let files = self.copy_stage(stage_dir)?;
    if files.is_empty() {
      return Ok(0);
    }

    self.store.update(&format!("install {project}"), |manifest| {
      let entry = manifest
        .projects
        .get_mut(project)
        .ok_or_else(|| InstallError::NotInstalled(project.to_string()))?;
      entry.files.extend(files.iter().cloned());
      Ok(())
    })?;

    info!(project, installed = files.len(), "installed post-install files");
    Ok(files.len())
  }

  /// Copy every file below `stage_dir` to the same relative path under the
  /// install root. Returns the relative paths.
  fn copy_stage(&self, stage_dir: &Path) -> Result<BTreeSet<String>, InstallError> {
    let mut files = BTreeSet::new();
    for (from, rel) in walk_files(stage_dir)? {
      let to = self.install_root.join(&rel);
      if rel.ends_with(".pc") {
        self.install_pkgconfig(&from, &to, stage_dir)?;
      } else {
        copy_file(&from, &to)?;
      }
      files.insert(rel);
    }
    Ok(files)
  }

  fn install_pkgconfig(&self, from: &Path, to: &Path, stage_dir: &Path) -> Result<(), InstallError> {
    let content = fs::read_to_string(from).map_err(|source| InstallError::Io {
      path: from.to_path_buf(),
      source,
    })?;
    let stage = stage_dir.to_string_lossy();
    let root = self.install_root.to_string_lossy();
    let rewritten = content.replace(stage.as_ref(), root.as_ref());

    if let Some(parent) = to.parent() {
      fs::create_dir_all(parent).map_err(|source| InstallError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
    }
    fs::write(to, rewritten).map_err(|source| InstallError::Io {
      path: to.to_path_buf(),
      source,
    })
  }

  pub fn entry(&self, project: &str) -> Result<Option<ManifestEntry>, InstallError> {
    Ok(self.store.read()?.projects.remove(project))
  }

  /// Installed files of `project`, as absolute paths under the install root.
  pub fn manifest_for(&self, project: &str) -> Result<BTreeSet<PathBuf>, InstallError> {
    let entry = self
      .entry(project)?
      .ok_or_else(|| InstallError::NotInstalled(project.to_string()))?;
    Ok(entry.files.iter().map(|f| self.install_root.join(f)).collect())
  }

  /// Whether every file recorded for the entry is still present.
  pub fn is_intact(&self, entry: &ManifestEntry) -> bool {
    entry.files.iter().all(|f| self.install_root.join(f).exists())
  }

  /// Clear the recorded fingerprint so the next run rebuilds `project`. The
  /// file list is kept so that rebuild can still remove stale files.
  pub fn invalidate(&self, project: &str) -> Result<(), InstallError> {
    self.store.update(&format!("invalidate {project}"), |manifest| {
      if let Some(entry) = manifest.projects.get_mut(project) {
        entry.fingerprint = Fingerprint(String::new());
      }
      Ok(())
    })
  }

  /// Remove a project's files and its manifest entry. Files also listed by
  /// another project are kept.
  pub fn uninstall(&self, project: &str) -> Result<usize, InstallError> {
    let removed = self.store.update(&format!("uninstall {project}"), |manifest| {
      let entry = manifest
        .projects
        .remove(project)
        .ok_or_else(|| InstallError::NotInstalled(project.to_string()))?;

      let mut removed = 0;
      for file in &entry.files {
        if manifest.owners_except(file, project).next().is_some() {
          debug!(project, file = %file, "kept, shared with another project");
          continue;
        }
        if remove_file(&self.install_root.join(file))? {
          removed += 1;
        }
      }
      Ok(removed)
    })?;

    info!(project, removed, "uninstalled");
    Ok(removed)
  }
}

/// Remove a file, tolerating one that is already gone.
fn remove_file(path: &Path) -> Result<bool, InstallError> {
  match fs::remove_file(path) {
    Ok(()) => Ok(true),
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      warn!(path = %path.display(), "recorded file already missing");
      Ok(false)
    }
    Err(source) => Err(InstallError::Io {
      path: path.to_path_buf(),
      source,
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn record(version: &str) -> InstallRecord {
    InstallRecord {
      version: version.to_string(),
      fingerprint: Fingerprint(format!("fp-{version}")),
      source_hash: "deadbeef".to_string(),
    }
  }

  fn stage(root: &Path, files: &[(&str, &str)]) -> PathBuf {
    let stage = root.join("stage");
    let _ = fs::remove_dir_all(&stage);
    for (rel, content) in files {
      let path = stage.join(rel);
      fs::create_dir_all(path.parent().unwrap()).unwrap();
      fs::write(path, content).unwrap();
    }
    stage
  }

  #[test]
  fn install_copies_files_and_records_them() {
    let temp = TempDir::new().unwrap();
    let installer = ArtifactInstaller::new(temp.path().join("root"));
    let stage = stage(
      temp.path(),
      &[("include/cairo/cairo.h", "h"), ("lib/cairo.lib", "lib"), ("share/doc/cairo/COPYING", "lgpl")],
    );

    let report = installer.install("cairo", &stage, record("1.18.0")).unwrap();
    assert_eq!(report, InstallReport { installed: 3, removed: 0 });

    let files = installer.manifest_for("cairo").unwrap();
    assert!(files.contains(&temp.path().join("root").join("include/cairo/cairo.h")));
    assert!(temp.path().join("root/lib/cairo.lib").is_file());

    let entry = installer.entry("cairo").unwrap().unwrap();
    assert_eq!(entry.version, "1.18.0");
    assert!(entry.files.contains("share/doc/cairo/COPYING"));
    assert!(installer.is_intact(&entry));
  }

  #[test]
  fn reinstall_removes_stale_files_of_that_project_only() {
    let temp = TempDir::new().unwrap();
    let installer = ArtifactInstaller::new(temp.path().join("root"));

    let pango_stage = temp.path().join("pango");
    fs::create_dir_all(pango_stage.join("lib")).unwrap();
    fs::write(pango_stage.join("lib/pango.lib"), "p").unwrap();
    installer.install("pango", &pango_stage, record("1.50")).unwrap();

    let stage1 = stage(temp.path(), &[("lib/old.lib", "o"), ("lib/keep.lib", "k")]);
    installer.install("cairo", &stage1, record("1.0")).unwrap();
    let stage2 = stage(temp.path(), &[("lib/keep.lib", "k2")]);
    let report = installer.install("cairo", &stage2, record("1.1")).unwrap();

    assert_eq!(report.removed, 1);
    assert!(!temp.path().join("root/lib/old.lib").exists());
    assert_eq!(fs::read_to_string(temp.path().join("root/lib/keep.lib")).unwrap(), "k2");
    assert!(temp.path().join("root/lib/pango.lib").exists());
    assert_eq!(installer.entry("cairo").unwrap().unwrap().version, "1.1");
  }

  #[test]
  fn pkgconfig_prefix_is_rewritten() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    let installer = ArtifactInstaller::new(&root);
    let stage_dir = temp.path().join("stage");
    let pc = format!("prefix={}\nlibdir=${{prefix}}/lib\n", stage_dir.display());
    let stage = stage(temp.path(), &[("lib/pkgconfig/cairo.pc", pc.as_str())]);

    installer.install("cairo", &stage, record("1.18.0")).unwrap();

    let installed = fs::read_to_string(root.join("lib/pkgconfig/cairo.pc")).unwrap();
    assert!(installed.starts_with(&format!("prefix={}\n", root.display())));
  }

  #[test]
  fn uninstall_keeps_shared_files() {
    let temp = TempDir::new().unwrap();
    let installer = ArtifactInstaller::new(temp.path().join("root"));

    let a = stage(temp.path(), &[("share/licenses/common.txt", "x"), ("bin/a.exe", "a")]);
    installer.install("a", &a, record("1")).unwrap();
    let b = stage(temp.path(), &[("share/licenses/common.txt", "x")]);
    installer.install("b", &b, record("1")).unwrap();

    assert_eq!(installer.uninstall("a").unwrap(), 1);
    assert!(!temp.path().join("root/bin/a.exe").exists());
    assert!(temp.path().join("root/share/licenses/common.txt").exists());
    assert!(installer.entry("a").unwrap().is_none());
    assert!(matches!(installer.uninstall("a"), Err(InstallError::NotInstalled(_))));
  }

  #[test]
  fn invalidate_clears_fingerprint_only() {
    let temp = TempDir::new().unwrap();
    let installer = ArtifactInstaller::new(temp.path().join("root"));
    let stage = stage(temp.path(), &[("lib/gtk.lib", "g")]);
    installer.install("gtk3", &stage, record("3.24")).unwrap();

    installer.invalidate("gtk3").unwrap();
    installer.invalidate("not-installed").unwrap();

    let entry = installer.entry("gtk3").unwrap().unwrap();
    assert!(entry.fingerprint.0.is_empty());
    assert!(entry.files.contains("lib/gtk.lib"));
  }

  #[test]
  fn install_extra_adds_to_existing_entry() {
    let temp = TempDir::new().unwrap();
    let installer = ArtifactInstaller::new(temp.path().join("root"));
    let main = stage(temp.path(), &[("lib/gtk.lib", "g")]);
    installer.install("gtk3", &main, record("3.24")).unwrap();

    let extra = temp.path().join("extra");
    fs::create_dir_all(extra.join("share/gir-1.0")).unwrap();
    fs::write(extra.join("share/gir-1.0/Gtk-3.0.gir"), "gir").unwrap();
    assert_eq!(installer.install_extra("gtk3", &extra).unwrap(), 1);

    let entry = installer.entry("gtk3").unwrap().unwrap();
    assert!(entry.files.contains("lib/gtk.lib"));
    assert!(entry.files.contains("share/gir-1.0/Gtk-3.0.gir"));
    assert_eq!(entry.fingerprint, Fingerprint("fp-3.24".to_string()));
    assert!(temp.path().join("root/share/gir-1.0/Gtk-3.0.gir").is_file());

    assert_eq!(installer.install_extra("gtk3", &temp.path().join("missing")).unwrap(), 0);
    assert!(matches!(
      installer.install_extra("pango", &extra),
      Err(InstallError::NotInstalled(_))
    ));
  }

  #[test]
  fn copy_into_file_and_directory() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("COPYING"), "gpl").unwrap();
    fs::create_dir_all(temp.path().join("icons/16x16")).unwrap();
    fs::write(temp.path().join("icons/16x16/a.png"), "png").unwrap();
    let dest = temp.path().join("out");

    let written = copy_into(&temp.path().join("COPYING"), &dest.join("share/doc/gtk3")).unwrap();
    assert_eq!(written, vec![dest.join("share/doc/gtk3/COPYING")]);

    let written = copy_into(&temp.path().join("icons"), &dest.join("share")).unwrap();
    assert_eq!(written, vec![dest.join("share/icons/16x16/a.png")]);

    assert!(matches!(
      copy_into(&temp.path().join("nope"), &dest),
      Err(InstallError::MissingSource { .. })
    ));
  }
}
