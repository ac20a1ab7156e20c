//! SHA-256 helpers for archive verification and build fingerprints.
//!
//! - `ContentHash`: full 64-character digest of a file or byte buffer
//! - `Fingerprint`: digest of a serialized build identity
//! - `Hashable`: derive a `Fingerprint` from any `Serialize` type

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type HashError = serde_json::Error;

/// A full lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Case-insensitive comparison against a digest written by hand in a recipe.
  pub fn matches(&self, expected: &str) -> bool {
    self.0.eq_ignore_ascii_case(expected.trim())
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identity of one build: recipe content, patch contents and the fingerprints
/// of every dependency. Equal fingerprints mean the installed tree is reusable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn fingerprint(&self) -> Result<Fingerprint, HashError> {
    let serialized = serde_json::to_string(self)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(Fingerprint(hex::encode(hasher.finalize())))
  }
}

/// Hash a file's contents in 8 KiB chunks.
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
  let mut file = fs::File::open(path)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}
