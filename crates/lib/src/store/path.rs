//! Store path names and the store directory they live in.
//!
//! A store path base name has the form `<hash>-<name>`, where `<hash>` is a
//! 32 character lowercase hex digest (see `util::hash::ObjectHash`).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{OBJ_HASH_PREFIX_LEN, STORE_PATH_NAME_MAX_LEN};
use crate::util::hash::ObjectHash;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path '{path}' is not a valid store path: {reason}")]
pub struct BadStorePath {
  pub path: String,
  pub reason: String,
}

impl BadStorePath {
  fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      reason: reason.into(),
    }
  }
}

/// The base name of a store object, independent of where the store lives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath {
  hash: String,
  name: String,
}

impl StorePath {
  pub fn new(hash: &ObjectHash, name: &str) -> Result<Self, BadStorePath> {
    Self::from_base_name(&format!("{}-{}", hash, name))
  }

  pub fn from_base_name(base: &str) -> Result<Self, BadStorePath> {
    if base.len() < OBJ_HASH_PREFIX_LEN + 2 {
      return Err(BadStorePath::new(base, "too short"));
    }
    let (hash, rest) = base.split_at(OBJ_HASH_PREFIX_LEN);
    if !hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
      return Err(BadStorePath::new(base, "hash part is not lowercase hex"));
    }
    let name = rest
      .strip_prefix('-')
      .ok_or_else(|| BadStorePath::new(base, "missing '-' after hash part"))?;
    check_name(name).map_err(|reason| BadStorePath::new(base, reason))?;
    Ok(Self {
      hash: hash.to_string(),
      name: name.to_string(),
    })
  }

  pub fn hash_part(&self) -> &str {
    &self.hash
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_derivation(&self) -> bool {
    self.name.ends_with(".drv")
  }
}

fn check_name(name: &str) -> Result<(), String> {
  if name.is_empty() {
    return Err("name is empty".to_string());
  }
  if name.len() > STORE_PATH_NAME_MAX_LEN {
    return Err(format!("name is longer than {STORE_PATH_NAME_MAX_LEN} characters"));
  }
  if name.starts_with('.') {
    return Err("name must not start with '.'".to_string());
  }
  if let Some(c) = name
    .chars()
    .find(|c| !(c.is_ascii_alphanumeric() || "+-._?=".contains(*c)))
  {
    return Err(format!("name contains illegal character '{c}'"));
  }
  Ok(())
}

impl fmt::Display for StorePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.hash, self.name)
  }
}

impl TryFrom<String> for StorePath {
  type Error = BadStorePath;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::from_base_name(&value)
  }
}

impl From<StorePath> for String {
  fn from(value: StorePath) -> Self {
    value.to_string()
  }
}

/// The directory a store lives in; turns base names into full paths and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir(PathBuf);

impl StoreDir {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self(path.into())
  }

  pub fn path(&self) -> &Path {
    &self.0
  }

  pub fn to_path(&self, path: &StorePath) -> PathBuf {
    self.0.join(path.to_string())
  }

  pub fn print_path(&self, path: &StorePath) -> String {
    self.to_path(path).to_string_lossy().into_owned()
  }

  pub fn is_in_store(&self, path: &str) -> bool {
    Path::new(path).strip_prefix(&self.0).is_ok_and(|rest| rest.components().next().is_some())
  }

  /// Parse a path that must name a store object directly.
  pub fn parse_path(&self, path: &str) -> Result<StorePath, BadStorePath> {
    let (store_path, rest) = self.to_store_path(path)?;
    if !rest.is_empty() {
      return Err(BadStorePath::new(path, "path points inside a store object"));
    }
    Ok(store_path)
  }

  /// Split a path below the store into the owning store object and the
  /// remainder inside it.
  pub fn to_store_path(&self, path: &str) -> Result<(StorePath, String), BadStorePath> {
    let rel = Path::new(path)
      .strip_prefix(&self.0)
      .map_err(|_| BadStorePath::new(path, format!("not in the store '{}'", self.0.display())))?;
    let mut components = rel.components();
    let base = components
      .next()
      .ok_or_else(|| BadStorePath::new(path, "path is the store directory itself"))?;
    let store_path = StorePath::from_base_name(&base.as_os_str().to_string_lossy())
      .map_err(|e| BadStorePath::new(path, e.reason))?;
    let rest = components.as_path().to_string_lossy().into_owned();
    Ok((store_path, rest))
  }

  /// Resolve symlinks in `path` (a result link, for instance) and return the
  /// store object it points into. Paths that do not exist are taken lexically.
  pub fn follow_links_to_store_path(&self, path: &str) -> Result<StorePath, BadStorePath> {
    let Ok(resolved) = dunce::canonicalize(path) else {
      return Ok(self.to_store_path(path)?.0);
    };
    let resolved = resolved.to_string_lossy().into_owned();
    match self.to_store_path(&resolved) {
      Ok((store_path, _)) => Ok(store_path),
      Err(err) => {
        let canonical_store = dunce::canonicalize(&self.0).map_err(|_| err.clone())?;
        StoreDir::new(canonical_store)
          .to_store_path(&resolved)
          .map(|(store_path, _)| store_path)
          .map_err(|_| err)
      }
    }
  }
}

impl fmt::Display for StoreDir {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.display())
  }
}
