//! Archive extraction with the single top-level directory stripped.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

use super::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
  TarGz,
  TarXz,
  Tar,
  Zip,
}

impl ArchiveFormat {
  /// Detect the format from a file name.
  pub fn detect(file_name: &str) -> Option<Self> {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
      Some(Self::TarGz)
    } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
      Some(Self::TarXz)
    } else if lower.ends_with(".tar") {
      Some(Self::Tar)
    } else if lower.ends_with(".zip") {
      Some(Self::Zip)
    } else {
      None
    }
  }
}

fn extract_error(archive: &Path, reason: impl ToString) -> FetchError {
  FetchError::Extract {
    archive: archive.to_path_buf(),
    reason: reason.to_string(),
  }
}

/// Unpack `archive` into `dest` (created if missing).
///
/// When every entry shares one top-level directory (`cairo-1.18.0/...`) that
/// directory is stripped; otherwise entries are unpacked as they are.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), FetchError> {
  let name = archive
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  let format = ArchiveFormat::detect(&name).ok_or_else(|| extract_error(archive, "unsupported archive format"))?;

  fs::create_dir_all(dest).map_err(|source| FetchError::Io {
    path: dest.to_path_buf(),
    source,
  })?;

  match format {
    ArchiveFormat::TarGz => unpack_tar(archive, dest, |f| Box::new(GzDecoder::new(f)) as Box<dyn Read>),
    ArchiveFormat::TarXz => unpack_tar(archive, dest, |f| Box::new(XzDecoder::new(f)) as Box<dyn Read>),
    ArchiveFormat::Tar => unpack_tar(archive, dest, |f| Box::new(f) as Box<dyn Read>),
    ArchiveFormat::Zip => unpack_zip(archive, dest),
  }?;

  debug!(archive = %archive.display(), dest = %dest.display(), "unpacked");
  Ok(())
}

type Decoder = fn(BufReader<File>) -> Box<dyn Read>;

fn open_tar(archive: &Path, decoder: Decoder) -> Result<Archive<Box<dyn Read>>, FetchError> {
  let file = File::open(archive).map_err(|source| FetchError::Io {
    path: archive.to_path_buf(),
    source,
  })?;
  Ok(Archive::new(decoder(BufReader::new(file))))
}

/// The shared first path component of `paths`, if there is exactly one and
/// at least one entry lives below it.
fn common_root<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Option<PathBuf> {
  let mut root: Option<PathBuf> = None;
  let mut nested = false;
  for path in paths {
    let mut components = path.components();
    let first: PathBuf = components.next()?.as_os_str().into();
    if components.next().is_some() {
      nested = true;
    }
    match &root {
      Some(existing) if *existing != first => return None,
      Some(_) => {}
      None => root = Some(first),
    }
  }
  root.filter(|_| nested)
}

fn strip(path: &Path, root: Option<&Path>) -> PathBuf {
  match root {
    Some(root) => path.strip_prefix(root).map(Path::to_path_buf).unwrap_or_default(),
    None => path.to_path_buf(),
  }
}

fn is_contained(path: &Path) -> bool {
  path
    .components()
    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn unpack_tar(archive: &Path, dest: &Path, decoder: Decoder) -> Result<(), FetchError> {
  // First pass decides whether a top-level directory is stripped.
  let mut listing = open_tar(archive, decoder)?;
  let mut paths = Vec::new();
  for entry in listing.entries().map_err(|e| extract_error(archive, e))? {
    let entry = entry.map_err(|e| extract_error(archive, e))?;
    let path = entry.path().map_err(|e| extract_error(archive, e))?;
    paths.push(path.into_owned());
  }
  let root = common_root(paths.iter().map(PathBuf::as_path));

  let mut tar = open_tar(archive, decoder)?;
  for entry in tar.entries().map_err(|e| extract_error(archive, e))? {
    let mut entry = entry.map_err(|e| extract_error(archive, e))?;
    let path = entry.path().map_err(|e| extract_error(archive, e))?.into_owned();
    let stripped = strip(&path, root.as_deref());

    if stripped.as_os_str().is_empty() {
      continue;
    }
    if !is_contained(&stripped) {
      return Err(extract_error(archive, format!("entry '{}' escapes the destination", path.display())));
    }

    let dest_path = dest.join(&stripped);
    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent).map_err(|source| FetchError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    entry.unpack(&dest_path).map_err(|e| extract_error(archive, e))?;
  }

  Ok(())
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<(), FetchError> {
  let file = File::open(archive).map_err(|source| FetchError::Io {
    path: archive.to_path_buf(),
    source,
  })?;
  let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| extract_error(archive, e))?;

  let mut names = Vec::with_capacity(zip.len());
  for i in 0..zip.len() {
    let entry = zip.by_index(i).map_err(|e| extract_error(archive, e))?;
    let name = entry
      .enclosed_name()
      .ok_or_else(|| extract_error(archive, format!("unsafe entry name '{}'", entry.name())))?;
    names.push(name);
  }
  let root = common_root(names.iter().map(PathBuf::as_path));

  for (i, name) in names.iter().enumerate() {
    let mut entry = zip.by_index(i).map_err(|e| extract_error(archive, e))?;
    let stripped = strip(name, root.as_deref());
    if stripped.as_os_str().is_empty() {
      continue;
    }

    let dest_path = dest.join(&stripped);
    let io_error = |source| FetchError::Io {
      path: dest_path.clone(),
      source,
    };

    if entry.is_dir() {
      fs::create_dir_all(&dest_path).map_err(io_error)?;
      continue;
    }
    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent).map_err(io_error)?;
    }
    let mut out = File::create(&dest_path).map_err(io_error)?;
    std::io::copy(&mut entry, &mut out).map_err(io_error)?;

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      if let Some(mode) = entry.unix_mode() {
        fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode)).map_err(io_error)?;
      }
    }
  }

  Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
  use std::path::Path;

  use flate2::Compression;
  use flate2::write::GzEncoder;

  /// Build a `.tar.gz` in memory from `(path, contents)` pairs.
  pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
      let mut header = tar::Header::new_gnu();
      header.set_size(contents.len() as u64);
      header.set_mode(0o644);
      header.set_cksum();
      builder
        .append_data(&mut header, Path::new(path), contents.as_bytes())
        .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::testutil::tar_gz;
  use super::*;
  use std::io::Write;
  use tempfile::TempDir;

  #[test]
  fn detects_formats() {
    assert_eq!(ArchiveFormat::detect("cairo-1.18.0.tar.xz"), Some(ArchiveFormat::TarXz));
    assert_eq!(ArchiveFormat::detect("zlib-1.3.tgz"), Some(ArchiveFormat::TarGz));
    assert_eq!(ArchiveFormat::detect("glib.TAR"), Some(ArchiveFormat::Tar));
    assert_eq!(ArchiveFormat::detect("pkg.zip"), Some(ArchiveFormat::Zip));
    assert_eq!(ArchiveFormat::detect("pkg.tar.bz2"), None);
  }

  #[test]
  fn strips_single_top_level_directory() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("zlib-1.3.tar.gz");
    fs::write(
      &archive,
      tar_gz(&[("zlib-1.3/zlib.h", "header"), ("zlib-1.3/win32/Makefile.msc", "all:")]),
    )
    .unwrap();

    let dest = temp.path().join("out");
    unpack_archive(&archive, &dest).unwrap();

    assert_eq!(fs::read_to_string(dest.join("zlib.h")).unwrap(), "header");
    assert!(dest.join("win32/Makefile.msc").is_file());
    assert!(!dest.join("zlib-1.3").exists());
  }

  #[test]
  fn keeps_layout_without_common_root() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("flat.tar.gz");
    fs::write(&archive, tar_gz(&[("a.txt", "a"), ("dir/b.txt", "b")])).unwrap();

    let dest = temp.path().join("out");
    unpack_archive(&archive, &dest).unwrap();

    assert!(dest.join("a.txt").is_file());
    assert!(dest.join("dir/b.txt").is_file());
  }

  #[test]
  fn unpacks_tar_xz() {
    let temp = TempDir::new().unwrap();
    let tar_bytes = {
      let mut builder = tar::Builder::new(Vec::new());
      let mut header = tar::Header::new_gnu();
      header.set_size(3);
      header.set_mode(0o644);
      header.set_cksum();
      builder.append_data(&mut header, "pixman-0.42/README", "hey".as_bytes()).unwrap();
      builder.into_inner().unwrap()
    };
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(&tar_bytes).unwrap();
    let archive = temp.path().join("pixman-0.42.tar.xz");
    fs::write(&archive, encoder.finish().unwrap()).unwrap();

    let dest = temp.path().join("out");
    unpack_archive(&archive, &dest).unwrap();
    assert_eq!(fs::read_to_string(dest.join("README")).unwrap(), "hey");
  }

  #[test]
  fn unpacks_zip() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("nasm-2.16.zip");
    {
      let file = File::create(&archive).unwrap();
      let mut writer = zip::ZipWriter::new(file);
      let options = zip::write::SimpleFileOptions::default();
      writer.start_file("nasm-2.16/nasm.exe", options).unwrap();
      writer.write_all(b"MZ").unwrap();
      writer.finish().unwrap();
    }

    let dest = temp.path().join("out");
    unpack_archive(&archive, &dest).unwrap();
    assert_eq!(fs::read(dest.join("nasm.exe")).unwrap(), b"MZ");
  }

  #[test]
  fn corrupt_archive_is_extract_error() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("bad.tar.gz");
    fs::write(&archive, b"not gzip at all").unwrap();

    let err = unpack_archive(&archive, &temp.path().join("out")).unwrap_err();
    assert!(matches!(err, FetchError::Extract { .. }));
  }
}
