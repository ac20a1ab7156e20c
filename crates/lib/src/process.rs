//! External process execution.
//!
//! Every tool nbuild drives (patch, meson, msbuild, msgfmt, ...) is spawned
//! through [`ProcessRunner`]: the environment is cleared and replaced by the
//! materialized lane, output is appended to `<logs>/<stage>.log`, and a
//! cancelled run kills the child.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::builder::BuildError;
use crate::consts::LOG_TAIL_LINES;
use crate::context::BuildEnv;
use crate::platform::shell_command;

#[derive(Debug, Clone)]
pub struct ProcessRunner {
  log_dir: PathBuf,
  cancel: CancellationToken,
}

impl ProcessRunner {
  pub fn new(log_dir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
    Self {
      log_dir: log_dir.into(),
      cancel,
    }
  }

  pub fn log_path(&self, stage: &str) -> PathBuf {
    self.log_dir.join(format!("{stage}.log"))
  }

  /// Run `program` with `args` in `cwd` and return its trimmed stdout.
  ///
  /// A bare program name is looked up on the lane's `PATH`, not the PATH of
  /// the nbuild process.
  pub async fn run(
    &self,
    stage: &str,
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &BuildEnv,
  ) -> Result<String, BuildError> {
    if self.cancel.is_cancelled() {
      return Err(BuildError::Cancelled);
    }

    let vars = env.materialize();
    let resolved = resolve_program(program, vars.get("PATH").map(String::as_str), cwd)?;
    let command_line = render_command_line(program, args);
    info!(stage, cmd = %command_line, "running");
    debug!(program = %resolved.display(), cwd = %cwd.display(), "spawning process");

    let mut command = Command::new(&resolved);
    command
      .args(args)
      .current_dir(cwd)
      .env_clear()
      .envs(&vars)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let child = command.spawn().map_err(|source| BuildError::Spawn {
      program: program.to_string(),
      source,
    })?;

    let output = tokio::select! {
      output = child.wait_with_output() => output.map_err(|source| BuildError::Spawn {
        program: program.to_string(),
        source,
      })?,
      _ = self.cancel.cancelled() => {
        info!(stage, program, "cancelled, killing process");
        return Err(BuildError::Cancelled);
      }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    self.append_log(stage, &command_line, &stdout, &stderr).await?;

    if !output.status.success() {
      return Err(BuildError::Command {
        stage: stage.to_string(),
        program: program.to_string(),
        code: output.status.code(),
        tail: tail(&stdout, &stderr, LOG_TAIL_LINES),
      });
    }

    Ok(stdout.trim().to_string())
  }

  /// Run a shell command line through the platform shell.
  pub async fn shell(&self, stage: &str, script: &str, cwd: &Path, env: &BuildEnv) -> Result<String, BuildError> {
    let (shell, args) = shell_command(script);
    self.run(stage, &shell, &args, cwd, env).await
  }

  async fn append_log(&self, stage: &str, command_line: &str, stdout: &str, stderr: &str) -> Result<(), BuildError> {
    let path = self.log_path(stage);
    let io_err = |source| BuildError::Io {
      path: path.clone(),
      source,
    };

    tokio::fs::create_dir_all(&self.log_dir).await.map_err(io_err)?;
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .await
      .map_err(io_err)?;

    let mut text = format!("$ {command_line}\n");
    text.push_str(stdout);
    if !stderr.is_empty() {
      text.push_str(stderr);
    }
    if !text.ends_with('\n') {
      text.push('\n');
    }
    file.write_all(text.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)
  }
}

fn resolve_program(program: &str, path: Option<&str>, cwd: &Path) -> Result<PathBuf, BuildError> {
  let candidate = Path::new(program);
  if candidate.components().count() > 1 || candidate.is_absolute() {
    return Ok(candidate.to_path_buf());
  }

  which::which_in(program, path.map(OsString::from), cwd).map_err(|e| BuildError::Spawn {
    program: program.to_string(),
    source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
  })
}

fn render_command_line(program: &str, args: &[String]) -> String {
  std::iter::once(program)
    .chain(args.iter().map(String::as_str))
    .collect::<Vec<_>>()
    .join(" ")
}

fn tail(stdout: &str, stderr: &str, lines: usize) -> String {
  let all: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
  let start = all.len().saturating_sub(lines);
  all[start..].join("\n")
}
