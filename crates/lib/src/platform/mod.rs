pub mod paths;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target architecture passed to toolchains that need one (MSBuild platform names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArch {
  X64,
  X86,
  Arm64,
}

impl TargetArch {
  /// Detect the architecture of the running process.
  pub fn current() -> Self {
    match std::env::consts::ARCH {
      "x86" => TargetArch::X86,
      "aarch64" => TargetArch::Arm64,
      _ => TargetArch::X64,
    }
  }

  /// Platform name as understood by MSBuild solution files.
  pub fn msbuild_platform(&self) -> &'static str {
    match self {
      TargetArch::X64 => "x64",
      TargetArch::X86 => "Win32",
      TargetArch::Arm64 => "ARM64",
    }
  }
}

impl fmt::Display for TargetArch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetArch::X64 => write!(f, "x64"),
      TargetArch::X86 => write!(f, "x86"),
      TargetArch::Arm64 => write!(f, "arm64"),
    }
  }
}

impl FromStr for TargetArch {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "x64" | "x86_64" | "amd64" => Ok(TargetArch::X64),
      "x86" | "win32" | "i686" => Ok(TargetArch::X86),
      "arm64" | "aarch64" => Ok(TargetArch::Arm64),
      other => Err(format!("unknown architecture '{other}' (expected x64, x86 or arm64)")),
    }
  }
}

/// Separator used between entries of PATH-like variables.
pub const fn path_list_separator() -> &'static str {
  if cfg!(windows) { ";" } else { ":" }
}

/// Returns the shell binary and the arguments that run `script` through it.
#[cfg(unix)]
pub fn shell_command(script: &str) -> (String, Vec<String>) {
  ("/bin/sh".to_string(), vec!["-c".to_string(), script.to_string()])
}

/// Returns the shell binary and the arguments that run `script` through it.
#[cfg(windows)]
pub fn shell_command(script: &str) -> (String, Vec<String>) {
  ("cmd.exe".to_string(), vec!["/C".to_string(), script.to_string()])
}
