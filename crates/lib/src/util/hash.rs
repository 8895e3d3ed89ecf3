//! Hashing for store paths, source fingerprints and output verification.
//!
//! Store path base names start with an [`ObjectHash`]. Source trees and build
//! outputs are compared through [`ContentHash`]es of their serialized form.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// Truncated lowercase hex SHA-256, `OBJ_HASH_PREFIX_LEN` characters long.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl ObjectHash {
  pub fn of_str(input: &str) -> Self {
    let mut digest = hash_bytes(input.as_bytes()).0;
    digest.truncate(OBJ_HASH_PREFIX_LEN);
    ObjectHash(digest)
  }
}

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Types whose JSON serialization addresses them in the store.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    Ok(ObjectHash::of_str(&serde_json::to_string(self)?))
  }
}

/// A full 64-character SHA-256 hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeHashError {
  #[error("failed to traverse {path}: {message}")]
  Walk { path: PathBuf, message: String },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl TreeHashError {
  fn read(path: &Path, source: io::Error) -> Self {
    Self::Read {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Hash a store object or source tree.
///
/// The tree is serialized as a sorted list of entries: regular files
/// contribute their contents, symlinks their target and directories only
/// their name. Timestamps and permissions are ignored. Entries whose name is
/// in `exclude` are skipped along with anything below them; the root itself
/// is never excluded.
pub fn hash_path(root: &Path, exclude: &[&str]) -> Result<ContentHash, TreeHashError> {
  let mut hasher = Sha256::new();

  let walker = WalkDir::new(root)
    .follow_links(false)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.depth() == 0 || e.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  for entry in walker {
    let entry = entry.map_err(|e| TreeHashError::Walk {
      path: root.to_path_buf(),
      message: e.to_string(),
    })?;
    let relative = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");

    let kind = entry.file_type();
    if kind.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| TreeHashError::read(entry.path(), e))?;
      hasher.update(format!("symlink:{relative}:{}\n", target.to_string_lossy()));
    } else if kind.is_dir() {
      hasher.update(format!("dir:{relative}\n"));
    } else if kind.is_file() {
      let digest = hash_file(entry.path())?;
      hasher.update(format!("file:{relative}:{digest}\n"));
    }
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

pub fn hash_file(path: &Path) -> Result<ContentHash, TreeHashError> {
  let mut file = fs::File::open(path).map_err(|e| TreeHashError::read(path, e))?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(|e| TreeHashError::read(path, e))?;
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}
