//! Flakes: lockable sources of build definitions.
//!
//! A flake is a directory containing `flake.lua`, which returns a table:
//!
//! ```lua
//! return {
//!   description = "hello world",
//!   inputs = {
//!     lib = "path:./lib",
//!     data = { url = "git+https://example.com/data.git", flake = false },
//!   },
//!   outputs = function(inputs)
//!     return { packages = { ["x86_64-linux"] = { default = ... } } }
//!   end,
//! }
//! ```
//!
//! The `inputs` table must not depend on runtime globals; it is read
//! without the evaluator's builtins.

pub mod fetch;
pub mod flakeref;
pub mod lock_flags;
pub mod locker;
pub mod lockfile;
pub mod registry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mlua::{Lua, Table, Value};
use thiserror::Error;
use tracing::debug;

pub use fetch::{FetchError, FetchedSource};
pub use flakeref::{FlakeRef, FlakeRefError, FlakeSource, parse_flake_ref, parse_flake_ref_with_fragment};
pub use lock_flags::LockFlags;
pub use locker::{FlakeLocker, LockedFlake};
pub use lockfile::{InputPath, LockFile, LockFileError, LockedNode};
pub use registry::{Registries, Registry};

use crate::consts::FLAKE_FILE;

#[derive(Debug, Error)]
pub enum FlakeError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  FlakeRef(#[from] FlakeRefError),

  #[error(transparent)]
  LockFile(#[from] LockFileError),

  #[error("I/O error on '{path}': {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid registry '{path}': {message}")]
  Registry { path: String, message: String },

  #[error("cannot look up flake '{0}' because registries are disabled")]
  RegistryDisabled(String),

  #[error("cannot find flake '{0}' in the flake registries")]
  NotInRegistry(String),

  #[error("registry lookup of '{0}' does not terminate")]
  RegistryLoop(String),

  #[error("source tree referenced by '{flake_ref}' does not contain a '{FLAKE_FILE}' file")]
  MissingFlakeFile { flake_ref: String },

  #[error("invalid flake '{path}': {message}")]
  BadFlake { path: String, message: String },

  #[error("found circular import of flake '{0}'")]
  CircularImport(String),

  #[error("flake '{0}' requires lock file changes but they're not allowed due to '--no-update-lock-file'")]
  UpdateForbidden(String),

  #[error("cannot write modified lock file of flake '{0}' (use '--no-write-lock-file' to ignore)")]
  CannotWriteLock(String),
}

impl FlakeError {
  pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.as_ref().display().to_string(),
      source,
    }
  }
}

/// A declared flake input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeInput {
  /// As written in `flake.lua`; relative paths stay relative.
  pub flake_ref: FlakeRef,
  /// Whether the input is itself a flake with inputs of its own.
  pub is_flake: bool,
}

/// A fetched flake whose inputs have been read but not locked.
#[derive(Debug, Clone)]
pub struct Flake {
  /// The reference as the user wrote it.
  pub original_ref: FlakeRef,
  /// After registry lookup.
  pub resolved_ref: FlakeRef,
  pub locked_ref: FlakeRef,
  /// Root of the fetched source tree.
  pub source_root: PathBuf,
  /// Fingerprint of the fetched source tree.
  pub source_fingerprint: String,
  pub description: Option<String>,
  pub inputs: BTreeMap<String, FlakeInput>,
}

impl Flake {
  /// Directory containing `flake.lua`.
  pub fn dir(&self) -> PathBuf {
    match self.locked_ref.dir.as_deref() {
      Some(dir) => self.source_root.join(dir),
      None => self.source_root.clone(),
    }
  }

  pub fn flake_file(&self) -> PathBuf {
    self.dir().join(FLAKE_FILE)
  }

  /// Whether the source is a local directory the lock file can be written
  /// into.
  pub fn is_local(&self) -> bool {
    matches!(self.resolved_ref.source, FlakeSource::Path { .. })
  }
}

/// Resolve, fetch and read a flake.
pub fn get_flake(original_ref: &FlakeRef, registries: &Registries, cache_dir: &Path) -> Result<Flake, FlakeError> {
  let resolved_ref = registries.lookup(original_ref)?;
  let fetched = fetch::fetch(&resolved_ref, cache_dir)?;
  let dir = match resolved_ref.dir.as_deref() {
    Some(dir) => fetched.path.join(dir),
    None => fetched.path.clone(),
  };
  let flake_file = dir.join(FLAKE_FILE);
  if !flake_file.is_file() {
    return Err(FlakeError::MissingFlakeFile {
      flake_ref: resolved_ref.to_string(),
    });
  }
  let (description, inputs) = read_flake_file(&flake_file)?;
  debug!(flake = %resolved_ref, inputs = inputs.len(), "read flake");

  Ok(Flake {
    original_ref: original_ref.clone(),
    resolved_ref,
    locked_ref: fetched.locked,
    source_root: fetched.path,
    source_fingerprint: fetched.fingerprint,
    description,
    inputs,
  })
}

type FlakeMetadata = (Option<String>, BTreeMap<String, FlakeInput>);

/// Read `description` and `inputs` from a flake file.
pub fn read_flake_file(path: &Path) -> Result<FlakeMetadata, FlakeError> {
  let bad = |message: String| FlakeError::BadFlake {
    path: path.display().to_string(),
    message,
  };
  let source = std::fs::read_to_string(path).map_err(|e| FlakeError::io(path, e))?;

  let lua = Lua::new();
  let value: Value = lua
    .load(&source)
    .set_name(format!("@{}", path.display()))
    .eval()
    .map_err(|e| bad(e.to_string()))?;
  let Value::Table(table) = value else {
    return Err(bad(format!("{FLAKE_FILE} must return a table")));
  };

  let description: Option<String> = table.get("description").map_err(|e| bad(e.to_string()))?;
  match table.get::<Value>("outputs").map_err(|e| bad(e.to_string()))? {
    Value::Function(_) => {}
    _ => return Err(bad("'outputs' must be a function".to_string())),
  }

  let mut inputs = BTreeMap::new();
  if let Some(declared) = table.get::<Option<Table>>("inputs").map_err(|e| bad(e.to_string()))? {
    for pair in declared.pairs::<String, Value>() {
      let (name, spec) = pair.map_err(|e| bad(e.to_string()))?;
      if name == "self" {
        return Err(bad("input name 'self' is reserved".to_string()));
      }
      let input = match spec {
        Value::String(url) => FlakeInput {
          flake_ref: parse_flake_ref(&url.to_str().map_err(|e| bad(e.to_string()))?, None)?,
          is_flake: true,
        },
        Value::Table(spec) => {
          let url: String = spec
            .get("url")
            .map_err(|e| bad(format!("input '{name}' needs a 'url': {e}")))?;
          FlakeInput {
            flake_ref: parse_flake_ref(&url, None)?,
            is_flake: spec.get::<Option<bool>>("flake").map_err(|e| bad(e.to_string()))?.unwrap_or(true),
          }
        }
        _ => return Err(bad(format!("input '{name}' must be a string or a table"))),
      };
      inputs.insert(name, input);
    }
  }

  Ok((description, inputs))
}
