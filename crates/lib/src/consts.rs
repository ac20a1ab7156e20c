pub const APP_NAME: &str = "nbuild";

/// Directory inside the install root holding bookkeeping files.
pub const STATE_DIR: &str = ".nbuild";

pub const MANIFEST_FILENAME: &str = "manifest.json";

pub const MANIFEST_LOCK_FILENAME: &str = "manifest.lock";

/// Marker written next to an extracted source tree.
pub const SOURCE_MARKER: &str = ".nbuild-source.json";

pub const CONFIG_FILENAME: &str = "nbuild.toml";

/// Sentinel recipe version asking for upstream resolution.
pub const AUTO_VERSION: &str = "auto";

pub const DEFAULT_FETCH_RETRIES: u32 = 3;

pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Number of trailing output lines attached to a failed command error.
pub const LOG_TAIL_LINES: usize = 20;
