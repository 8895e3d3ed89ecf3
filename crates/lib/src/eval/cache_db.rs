//! Persistent storage behind the eval cache.
//!
//! Each database holds the entries of exactly one flake fingerprint, keyed
//! by attribute path. The file-backed database keeps one JSON document per
//! fingerprint:
//!
//! ```text
//! <cache_dir>/eval-cache-v1/<fingerprint>.json
//! ```
//!
//! Several processes may populate the same file concurrently; the last
//! writer wins, which only ever loses cache entries.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// An attribute path, the key of every cache entry.
pub type AttrKey = Vec<String>;

/// What the cache remembers about one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum CachedValue {
  /// An attribute set with these (sorted) names.
  Attrs(Vec<String>),
  String(String),
  Bool(bool),
  Int(i64),
  ListOfStrings(Vec<String>),
  /// The attribute does not exist.
  Missing,
  /// Evaluating the attribute failed.
  Failed,
  /// Some value the cache does not represent.
  Misc,
}

pub trait EvalCacheDb {
  fn get(&self, key: &AttrKey) -> Option<CachedValue>;

  fn put(&self, key: AttrKey, value: CachedValue);
}

/// In-memory database, shared between evaluators in tests.
#[derive(Debug, Default)]
pub struct MemoryEvalCacheDb {
  entries: RefCell<BTreeMap<AttrKey, CachedValue>>,
  hits: Cell<usize>,
  misses: Cell<usize>,
}

impl MemoryEvalCacheDb {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.borrow().is_empty()
  }

  pub fn hits(&self) -> usize {
    self.hits.get()
  }

  pub fn misses(&self) -> usize {
    self.misses.get()
  }
}

impl EvalCacheDb for MemoryEvalCacheDb {
  fn get(&self, key: &AttrKey) -> Option<CachedValue> {
    let value = self.entries.borrow().get(key).cloned();
    match value {
      Some(_) => self.hits.set(self.hits.get() + 1),
      None => self.misses.set(self.misses.get() + 1),
    }
    value
  }

  fn put(&self, key: AttrKey, value: CachedValue) {
    self.entries.borrow_mut().insert(key, value);
  }
}

#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
  entries: Vec<(AttrKey, CachedValue)>,
}

/// A JSON file per fingerprint, loaded on open and written back on flush
/// or drop when something changed.
#[derive(Debug)]
pub struct FileEvalCacheDb {
  path: PathBuf,
  entries: RefCell<BTreeMap<AttrKey, CachedValue>>,
  dirty: Cell<bool>,
}

impl FileEvalCacheDb {
  pub fn open(dir: &Path, fingerprint: &str) -> Self {
    let path = dir.join(format!("{fingerprint}.json"));
    let entries = match fs::read_to_string(&path) {
      Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
        Ok(file) => file.entries.into_iter().collect(),
        Err(e) => {
          warn!(path = %path.display(), error = %e, "ignoring corrupt eval cache");
          BTreeMap::new()
        }
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "cannot read eval cache");
        BTreeMap::new()
      }
    };
    debug!(path = %path.display(), entries = entries.len(), "opened eval cache");
    Self {
      path,
      entries: RefCell::new(entries),
      dirty: Cell::new(false),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Persist pending entries atomically.
  pub fn flush(&self) -> io::Result<()> {
    if !self.dirty.get() {
      return Ok(());
    }
    let dir = self.path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let file = CacheFile {
      entries: self.entries.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, &file).map_err(io::Error::other)?;
    tmp.flush()?;
    tmp.persist(&self.path).map_err(|e| e.error)?;
    self.dirty.set(false);
    debug!(path = %self.path.display(), "wrote eval cache");
    Ok(())
  }
}

impl EvalCacheDb for FileEvalCacheDb {
  fn get(&self, key: &AttrKey) -> Option<CachedValue> {
    self.entries.borrow().get(key).cloned()
  }

  fn put(&self, key: AttrKey, value: CachedValue) {
    let mut entries = self.entries.borrow_mut();
    if entries.get(&key) != Some(&value) {
      entries.insert(key, value);
      self.dirty.set(true);
    }
  }
}

impl Drop for FileEvalCacheDb {
  fn drop(&mut self) {
    if let Err(e) = self.flush() {
      warn!(path = %self.path.display(), error = %e, "failed to write eval cache");
    }
  }
}
