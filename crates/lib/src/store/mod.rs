//! The build store: where derivations and their outputs live.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── <hash>-<name>.drv        # derivations (JSON)
//! ├── <hash>-<name>[-<out>]    # build outputs (files or directories)
//! └── .realize/
//!     ├── valid/<base name>    # validity markers
//!     ├── derivers/<base name> # output -> derivation records
//!     └── tmp/                 # build directories
//! ```

pub mod build_result;
pub mod builder;
pub mod derivation;
pub mod local;
pub mod path;

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

pub use build_result::{BuildResult, BuildStatus, KeyedBuildResult, Realisation};
pub use derivation::Derivation;
pub use local::LocalStore;
pub use path::{BadStorePath, StoreDir, StorePath};

use crate::derived::{DerivedPath, OutputName, OutputsSpec, SingleDerivedPath};
use crate::placeholder::PlaceholderError;
use crate::util::hash::TreeHashError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
  #[default]
  Normal,
  /// Rebuild even valid outputs and replace them.
  Repair,
  /// Rebuild and compare against the existing outputs.
  Check,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error(transparent)]
  BadStorePath(#[from] BadStorePath),

  #[error("I/O error on '{path}': {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("invalid derivation '{name}': {message}")]
  InvalidDerivation { name: String, message: String },

  #[error("derivation '{0}' is not known to the store")]
  UnknownDerivation(String),

  #[error("derivation '{drv}' does not have an output named '{output}'")]
  MissingOutput { drv: String, output: String },

  #[error("output '{output}' of '{drv}' has not been realized yet, so it cannot be used as a derivation")]
  NotRealized { drv: String, output: String },

  #[error("build of '{path}' failed ({status:?}): {message}")]
  BuildFailed {
    path: String,
    status: BuildStatus,
    message: String,
  },

  #[error(transparent)]
  Placeholder(#[from] PlaceholderError),

  #[error(transparent)]
  Hash(#[from] TreeHashError),

  #[error("build runtime error: {0}")]
  Runtime(String),
}

impl StoreError {
  pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.as_ref().display().to_string(),
      source,
    }
  }
}

/// What a build of some paths would involve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingPaths {
  /// Derivations that would have to be built.
  pub will_build: BTreeSet<StorePath>,
  /// Paths that are not valid and that nothing knows how to produce.
  pub unknown: BTreeSet<StorePath>,
}

impl MissingPaths {
  pub fn is_empty(&self) -> bool {
    self.will_build.is_empty() && self.unknown.is_empty()
  }
}

/// The interface the installable engine consumes.
///
/// Evaluation writes derivations into an eval store; builds happen in a
/// (possibly different) build store that reads missing derivations from the
/// eval store.
pub trait Store {
  fn store_dir(&self) -> &StoreDir;

  fn is_valid_path(&self, path: &StorePath) -> bool;

  /// Whether `read_derivation` would succeed. Stores that keep derivations
  /// created in read-only mode in memory report those too.
  fn is_known_derivation(&self, drv_path: &StorePath) -> bool {
    self.is_valid_path(drv_path)
  }

  fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError>;

  /// Compute the derivation's path and, unless `read_only`, register it.
  fn write_derivation(&self, drv: &Derivation, read_only: bool) -> Result<StorePath, StoreError>;

  fn query_derivation_output_map(&self, drv_path: &StorePath) -> Result<BTreeMap<OutputName, StorePath>, StoreError> {
    let drv = self.read_derivation(drv_path)?;
    drv.output_paths(drv_path)
  }

  /// Derivations recorded as having produced `path`.
  fn query_valid_derivers(&self, path: &StorePath) -> Result<Vec<StorePath>, StoreError>;

  fn query_missing(&self, paths: &[DerivedPath]) -> Result<MissingPaths, StoreError> {
    let mut missing = MissingPaths::default();
    for path in paths {
      match path {
        DerivedPath::Opaque(p) => {
          if !self.is_valid_path(p) {
            missing.unknown.insert(p.clone());
          }
        }
        DerivedPath::Built { drv_path, outputs } => collect_missing(self, drv_path, outputs, &mut missing)?,
      }
    }
    Ok(missing)
  }

  /// Realize `paths` in one batch. Every requested path gets a result,
  /// successful or not; only infrastructure problems are errors.
  fn build_paths_with_results(
    &self,
    paths: &[DerivedPath],
    mode: BuildMode,
    eval_store: &dyn Store,
  ) -> Result<Vec<KeyedBuildResult>, StoreError>;
}

fn collect_missing<S: Store + ?Sized>(
  store: &S,
  drv_path: &SingleDerivedPath,
  outputs: &OutputsSpec,
  missing: &mut MissingPaths,
) -> Result<(), StoreError> {
  let drv_path = match drv_path {
    SingleDerivedPath::Opaque(path) => path.clone(),
    SingleDerivedPath::Built { drv_path: inner, output } => {
      let inner_drv = match resolve_drv_path(store, inner) {
        Ok(path) => path,
        Err(StoreError::NotRealized { .. }) => {
          return collect_missing(store, inner, &OutputsSpec::names([output.clone()]), missing);
        }
        Err(e) => return Err(e),
      };
      let path = output_path_of(store, &inner_drv, output)?;
      if !store.is_valid_path(&path) {
        missing.will_build.insert(inner_drv);
        return Ok(());
      }
      path
    }
  };

  let drv = store.read_derivation(&drv_path)?;
  let wanted_missing = drv
    .output_paths(&drv_path)?
    .iter()
    .any(|(name, path)| outputs.contains(name) && !store.is_valid_path(path));
  if wanted_missing && missing.will_build.insert(drv_path) {
    for (input, input_outputs) in &drv.input_drvs {
      collect_missing(store, input, &OutputsSpec::Names(input_outputs.clone()), missing)?;
    }
  }
  Ok(())
}

/// The store path of output `output` of the concrete derivation `drv_path`.
pub fn output_path_of<S: Store + ?Sized>(store: &S, drv_path: &StorePath, output: &str) -> Result<StorePath, StoreError> {
  store
    .query_derivation_output_map(drv_path)?
    .remove(output)
    .ok_or_else(|| StoreError::MissingOutput {
      drv: store.store_dir().print_path(drv_path),
      output: output.to_string(),
    })
}

/// Resolve a derived path that is to be read as a derivation.
///
/// `Opaque` paths are returned as is. For `Built` paths the named output of
/// the inner derivation must already be realized; a derivation that is
/// produced by a build cannot be read before that build ran.
pub fn resolve_drv_path<S: Store + ?Sized>(store: &S, drv_path: &SingleDerivedPath) -> Result<StorePath, StoreError> {
  match drv_path {
    SingleDerivedPath::Opaque(path) => Ok(path.clone()),
    SingleDerivedPath::Built { drv_path: inner, output } => {
      let inner = resolve_drv_path(store, inner)?;
      let path = output_path_of(store, &inner, output)?;
      if !store.is_valid_path(&path) {
        return Err(StoreError::NotRealized {
          drv: store.store_dir().print_path(&inner),
          output: output.clone(),
        });
      }
      Ok(path)
    }
  }
}
