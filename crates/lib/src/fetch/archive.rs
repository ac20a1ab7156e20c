//! Archive download with a content-addressed cache.
//!
//! ```text
//! {cache_dir}/archives/{sha256}/{file name from the URL}
//! ```
//!
//! A cached file is only trusted after its digest is recomputed. Downloads are
//! streamed into a temporary `.part` file next to the cache entry, hashed as
//! they arrive, and renamed into place only when the digest matches.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{FetchError, FetchOptions};
use crate::util::hash::{ContentHash, hash_bytes};

/// Cache location of the archive at `url` with digest `sha256`.
pub fn cache_path(cache_dir: &Path, sha256: &str, url: &str) -> PathBuf {
  cache_dir.join("archives").join(sha256).join(url_to_filename(url))
}

/// Return a verified local copy of the archive, downloading it if needed.
pub async fn obtain(url: &str, sha256: &str, opts: &FetchOptions) -> Result<PathBuf, FetchError> {
  let dest = cache_path(&opts.cache_dir, sha256, url);

  if let Ok(bytes) = fs::read(&dest).await {
    let actual = hash_bytes(&bytes);
    if actual.matches(sha256) {
      debug!(url = %url, path = %dest.display(), "archive cache hit");
      return Ok(dest);
    }
    warn!(url = %url, expected = %sha256, actual = %actual, "cached archive is corrupt, downloading again");
    let _ = fs::remove_file(&dest).await;
  }

  let parent = dest.parent().unwrap_or(&opts.cache_dir);
  fs::create_dir_all(parent).await.map_err(|source| FetchError::Io {
    path: parent.to_path_buf(),
    source,
  })?;
  // Removed on drop unless persisted.
  let partial = tempfile::Builder::new()
    .prefix(".download-")
    .suffix(".part")
    .tempfile_in(parent)
    .map_err(|source| FetchError::Io {
      path: parent.to_path_buf(),
      source,
    })?
    .into_temp_path();

  info!(url = %url, "downloading");
  let (actual, size) = download(url, &partial, opts).await?;
  if !actual.matches(sha256) {
    return Err(FetchError::Integrity {
      what: url.to_string(),
      expected: sha256.to_string(),
      actual: actual.0,
    });
  }

  partial.persist(&dest).map_err(|e| FetchError::Io {
    path: dest.clone(),
    source: e.error,
  })?;

  info!(url = %url, size, "download complete");
  Ok(dest)
}

enum Failure {
  /// Connection problems, timeouts, 5xx and 429.
  Transient(String),
  Fatal(String),
}

/// Download `url` into `partial`, retrying transient failures with
/// exponential backoff. Returns the digest and size of what was written.
async fn download(url: &str, partial: &Path, opts: &FetchOptions) -> Result<(ContentHash, u64), FetchError> {
  let parsed = Url::parse(url).map_err(|e| FetchError::Network {
    url: url.to_string(),
    attempts: 0,
    message: e.to_string(),
  })?;

  if parsed.scheme() == "file" {
    let path = parsed.to_file_path().map_err(|_| FetchError::Network {
      url: url.to_string(),
      attempts: 0,
      message: "not a local path".to_string(),
    })?;
    let bytes = fs::read(&path).await.map_err(|e| FetchError::Network {
      url: url.to_string(),
      attempts: 1,
      message: e.to_string(),
    })?;
    fs::write(partial, &bytes).await.map_err(|source| FetchError::Io {
      path: partial.to_path_buf(),
      source,
    })?;
    return Ok((hash_bytes(&bytes), bytes.len() as u64));
  }

  let client = reqwest::Client::new();
  let attempts = opts.retries + 1;
  let mut delay = Duration::from_millis(opts.backoff_ms);

  let mut attempt = 0;
  loop {
    attempt += 1;
    if opts.cancel.is_cancelled() {
      return Err(FetchError::Cancelled);
    }

    let outcome = tokio::select! {
      outcome = try_download(&client, parsed.clone(), partial) => outcome,
      _ = opts.cancel.cancelled() => return Err(FetchError::Cancelled),
    };
    let message = match outcome {
      Ok(written) => return Ok(written),
      Err(Failure::Fatal(message)) => {
        return Err(FetchError::Network {
          url: url.to_string(),
          attempts: attempt,
          message,
        });
      }
      Err(Failure::Transient(message)) => message,
    };

    if attempt >= attempts {
      return Err(FetchError::Network {
        url: url.to_string(),
        attempts,
        message,
      });
    }

    warn!(url = %url, attempt, error = %message, retry_in = ?delay, "download failed, retrying");
    tokio::select! {
      _ = tokio::time::sleep(delay) => {}
      _ = opts.cancel.cancelled() => return Err(FetchError::Cancelled),
    }
    delay *= 2;
  }
}

/// One attempt: stream the body into `partial`, truncating what an earlier
/// attempt left there.
async fn try_download(client: &reqwest::Client, url: Url, partial: &Path) -> Result<(ContentHash, u64), Failure> {
  let transient = |e: reqwest::Error| {
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
      Failure::Transient(e.to_string())
    } else {
      Failure::Fatal(e.to_string())
    }
  };
  let local = |e: std::io::Error| Failure::Fatal(format!("{}: {e}", partial.display()));

  let response = client.get(url).send().await.map_err(transient)?;
  let status = response.status();
  if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
    return Err(Failure::Transient(format!("HTTP {status}")));
  }
  if !status.is_success() {
    return Err(Failure::Fatal(format!("HTTP {status}")));
  }

  let mut file = fs::File::create(partial).await.map_err(local)?;
  let mut hasher = Sha256::new();
  let mut size = 0u64;
  let mut stream = response.bytes_stream();
  while let Some(chunk) = stream.next().await {
    let chunk = chunk.map_err(transient)?;
    hasher.update(&chunk);
    file.write_all(&chunk).await.map_err(local)?;
    size += chunk.len() as u64;
  }
  file.flush().await.map_err(local)?;

  Ok((ContentHash(hex::encode(hasher.finalize())), size))
}

/// Convert a URL to a safe file name.
///
/// Takes the last path component and sanitizes it, falling back to a digest
/// of the URL when nothing usable remains.
pub fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split(['?', '#']).next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  format!("download_{}", &hash_bytes(url.as_bytes()).0[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;
  use tokio_util::sync::CancellationToken;

  const BODY: &[u8] = b"pretend this is a tarball";

  fn options(cache_dir: &Path) -> FetchOptions {
    FetchOptions {
      cache_dir: cache_dir.to_path_buf(),
      retries: 2,
      backoff_ms: 1,
      force: false,
      cancel: CancellationToken::new(),
    }
  }

  #[test]
  fn url_to_filename_variants() {
    assert_eq!(url_to_filename("https://example.com/cairo-1.18.0.tar.xz"), "cairo-1.18.0.tar.xz");
    assert_eq!(url_to_filename("https://example.com/f.zip?token=abc"), "f.zip");
    assert_eq!(url_to_filename("https://example.com/a b.tar"), "a_b.tar");
    assert!(url_to_filename("https://example.com/").starts_with("download_"));
  }

  #[tokio::test]
  async fn downloads_then_serves_from_cache_without_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/zlib-1.3.tar.gz")
      .with_status(200)
      .with_body(BODY)
      .expect(1)
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let opts = options(temp.path());
    let url = format!("{}/zlib-1.3.tar.gz", server.url());
    let sha = hash_bytes(BODY).0;

    let first = obtain(&url, &sha, &opts).await.unwrap();
    let second = obtain(&url, &sha, &opts).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, cache_path(temp.path(), &sha, &url));
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn digest_mismatch_is_not_cached() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/zlib.tar.gz")
      .with_status(200)
      .with_body(b"pretend this is a tarbalL")
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let url = format!("{}/zlib.tar.gz", server.url());
    let sha = hash_bytes(BODY).0;

    let err = obtain(&url, &sha, &options(temp.path())).await.unwrap_err();
    match err {
      FetchError::Integrity { expected, actual, .. } => {
        assert_eq!(expected, sha);
        assert_ne!(actual, sha);
      }
      other => panic!("unexpected error: {other:?}"),
    }
    assert!(!cache_path(temp.path(), &sha, &url).exists());
    let leftovers = std::fs::read_dir(cache_path(temp.path(), &sha, &url).parent().unwrap())
      .unwrap()
      .count();
    assert_eq!(leftovers, 0);
  }

  #[tokio::test]
  async fn large_body_is_streamed_into_the_cache() {
    let body: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/gtk-3.24.tar.xz")
      .with_status(200)
      .with_body(&body)
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let url = format!("{}/gtk-3.24.tar.xz", server.url());
    let sha = hash_bytes(&body).0;

    let cached = obtain(&url, &sha, &options(temp.path())).await.unwrap();
    assert_eq!(std::fs::read(&cached).unwrap(), body);
    let entries: Vec<_> = std::fs::read_dir(cached.parent().unwrap())
      .unwrap()
      .map(|e| e.unwrap().file_name())
      .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("gtk-3.24.tar.xz")]);
  }

  #[tokio::test]
  async fn server_errors_are_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/flaky.tar.gz")
      .with_status(503)
      .expect(3)
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let url = format!("{}/flaky.tar.gz", server.url());

    let err = obtain(&url, &hash_bytes(BODY).0, &options(temp.path())).await.unwrap_err();
    assert!(matches!(err, FetchError::Network { attempts: 3, .. }));
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn client_errors_fail_immediately() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/missing.tar.gz")
      .with_status(404)
      .expect(1)
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let url = format!("{}/missing.tar.gz", server.url());

    let err = obtain(&url, &hash_bytes(BODY).0, &options(temp.path())).await.unwrap_err();
    match err {
      FetchError::Network { attempts, message, .. } => {
        assert_eq!(attempts, 1);
        assert!(message.contains("404"));
      }
      other => panic!("unexpected error: {other:?}"),
    }
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn corrupt_cache_entry_is_replaced() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/pixman.tar.gz")
      .with_status(200)
      .with_body(BODY)
      .expect(1)
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let url = format!("{}/pixman.tar.gz", server.url());
    let sha = hash_bytes(BODY).0;
    let cached = cache_path(temp.path(), &sha, &url);
    std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
    std::fs::write(&cached, b"truncated").unwrap();

    obtain(&url, &sha, &options(temp.path())).await.unwrap();
    assert_eq!(std::fs::read(&cached).unwrap(), BODY);
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn file_urls_read_local_mirrors() {
    let temp = TempDir::new().unwrap();
    let mirror = temp.path().join("mirror/libffi-3.4.tar.gz");
    std::fs::create_dir_all(mirror.parent().unwrap()).unwrap();
    std::fs::write(&mirror, BODY).unwrap();
    let url = Url::from_file_path(&mirror).unwrap().to_string();

    let cached = obtain(&url, &hash_bytes(BODY).0, &options(&temp.path().join("cache")))
      .await
      .unwrap();
    assert_eq!(cached.file_name().unwrap(), "libffi-3.4.tar.gz");
  }
}
