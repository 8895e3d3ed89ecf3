//! Per-user directories.
//!
//! Unix follows the XDG base directory layout. Windows uses the known folder
//! variables, with the cache nested under the local data directory.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::consts::{APP_NAME, STORE_DIR_ENV};

#[derive(Debug, Clone, Copy)]
enum UserDir {
  Config,
  Data,
  Cache,
}

impl UserDir {
  #[cfg(not(windows))]
  fn base(self) -> PathBuf {
    let (var, fallback) = match self {
      Self::Config => ("XDG_CONFIG_HOME", ".config"),
      Self::Data => ("XDG_DATA_HOME", ".local/share"),
      Self::Cache => ("XDG_CACHE_HOME", ".cache"),
    };
    non_empty_var(var).map_or_else(|| home_dir().join(fallback), PathBuf::from)
  }

  #[cfg(windows)]
  fn base(self) -> PathBuf {
    let var = match self {
      Self::Config => "APPDATA",
      Self::Data | Self::Cache => "LOCALAPPDATA",
    };
    non_empty_var(var).map_or_else(home_dir, PathBuf::from)
  }

  fn resolve(self) -> PathBuf {
    let dir = self.base().join(APP_NAME);
    match self {
      Self::Cache if cfg!(windows) => dir.join("Cache"),
      _ => dir,
    }
  }
}

fn non_empty_var(name: &str) -> Option<OsString> {
  std::env::var_os(name).filter(|v| !v.is_empty())
}

/// The user's home directory, `/` when it cannot be determined.
pub fn home_dir() -> PathBuf {
  let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
  non_empty_var(var).map_or_else(|| PathBuf::from("/"), PathBuf::from)
}

/// Holds the user flake registry.
pub fn config_dir() -> PathBuf {
  UserDir::Config.resolve()
}

pub fn data_dir() -> PathBuf {
  UserDir::Data.resolve()
}

/// Holds the eval cache and fetched flake sources.
pub fn cache_dir() -> PathBuf {
  UserDir::Cache.resolve()
}

/// Root of the local store, `$REALIZE_STORE_DIR` if set.
pub fn store_dir() -> PathBuf {
  non_empty_var(STORE_DIR_ENV).map_or_else(|| data_dir().join("store"), PathBuf::from)
}
