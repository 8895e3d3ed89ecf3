//! Running derivation builders.
//!
//! Builders run with an isolated environment:
//! - all inherited variables are cleared
//! - `PATH` is `/path-not-set` and `HOME` is `/homeless-shelter`
//! - `TMPDIR`/`TMP`/`TEMP`/`TEMPDIR` point at the build directory
//! - one variable per output holds that output's final store path
//! - the derivation's own `env` is merged last

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::consts::SOURCE_DATE_EPOCH;

/// Lines of builder output kept for error messages.
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum BuilderError {
  #[error("failed to run builder: {0}")]
  Io(#[from] std::io::Error),

  #[error("builder exited with {}{}", exit_code_text(*code), log_tail_text(log))]
  Failed { code: Option<i32>, log: String },
}

fn exit_code_text(code: Option<i32>) -> String {
  match code {
    Some(code) => format!("code {code}"),
    None => "a signal".to_string(),
  }
}

fn log_tail_text(log: &str) -> String {
  if log.is_empty() {
    String::new()
  } else {
    format!("; last log lines:\n{log}")
  }
}

/// Run `script` for a derivation named `name`.
///
/// Returns the builder's stdout, trimmed.
pub async fn run_builder(
  name: &str,
  script: &str,
  env: &BTreeMap<String, String>,
  outputs: &BTreeMap<String, PathBuf>,
  build_dir: &Path,
) -> Result<String, BuilderError> {
  info!(drv = %name, "running builder");

  let tmp_dir = build_dir.join("tmp");
  tokio::fs::create_dir_all(&tmp_dir).await?;

  let (shell, shell_args) = get_shell();

  let mut command = Command::new(shell);
  command
    .args(shell_args)
    .arg(script)
    .current_dir(build_dir)
    .env_clear()
    .env("PATH", "/path-not-set")
    .env("HOME", "/homeless-shelter")
    .env("TMPDIR", &tmp_dir)
    .env("TMP", &tmp_dir)
    .env("TEMP", &tmp_dir)
    .env("TEMPDIR", &tmp_dir)
    .env("REALIZE_BUILD_TOP", build_dir)
    .env("LANG", "C")
    .env("LC_ALL", "C")
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .env("name", name);

  for (output, path) in outputs {
    command.env(output, path);
  }
  for (key, value) in env {
    command.env(key, value);
  }

  debug!(shell = %shell, build_dir = ?build_dir, "spawning builder");

  let output = command.output().await?;
  let stdout = String::from_utf8_lossy(&output.stdout);
  let stderr = String::from_utf8_lossy(&output.stderr);

  if !output.status.success() {
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "builder stderr");
    }
    return Err(BuilderError::Failed {
      code: output.status.code(),
      log: tail(&format!("{stdout}{stderr}")),
    });
  }

  let stdout = stdout.trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "builder output");
  }
  Ok(stdout)
}

fn tail(log: &str) -> String {
  let lines: Vec<&str> = log.lines().collect();
  let start = lines.len().saturating_sub(LOG_TAIL_LINES);
  lines[start..].join("\n")
}

/// Builders always use the system shell rather than `$SHELL`, which may
/// source user profiles.
#[cfg(unix)]
fn get_shell() -> (&'static str, &'static [&'static str]) {
  ("/bin/sh", &["-c"])
}

#[cfg(windows)]
fn get_shell() -> (&'static str, &'static [&'static str]) {
  ("powershell.exe", &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"])
}
