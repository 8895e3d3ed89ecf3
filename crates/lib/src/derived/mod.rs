//! Derived paths: store paths that may only exist once something is built.
//!
//! A [`SingleDerivedPath`] is either an existing store object or one output
//! of a derivation, where the derivation path may itself be the output of
//! another derivation (a dynamic derivation):
//!
//! ```text
//! /store/<hash>-gen.drv^out^bin
//!   Built { Built { Opaque(gen.drv), "out" }, "bin" }
//! ```

pub mod built;
pub mod outputs_spec;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use built::{BuiltPath, SingleBuiltPath};
pub use outputs_spec::{ExtendedOutputsSpec, OutputName, OutputsSpec, OutputsSpecError};

use crate::store::path::{BadStorePath, StoreDir, StorePath};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SingleDerivedPath {
  Opaque(StorePath),
  Built {
    drv_path: Box<SingleDerivedPath>,
    output: OutputName,
  },
}

impl SingleDerivedPath {
  pub fn built(drv_path: SingleDerivedPath, output: impl Into<OutputName>) -> Self {
    Self::Built {
      drv_path: Box::new(drv_path),
      output: output.into(),
    }
  }

  /// Parse a full path with optional `^output` links, e.g.
  /// `/store/<hash>-a.drv^out`.
  pub fn parse(store_dir: &StoreDir, s: &str) -> Result<Self, BadStorePath> {
    Self::parse_with(s, &|base| store_dir.parse_path(base))
  }

  /// Parse the store-independent rendering produced by `Display`.
  pub fn parse_base_name(s: &str) -> Result<Self, BadStorePath> {
    Self::parse_with(s, &StorePath::from_base_name)
  }

  fn parse_with(s: &str, opaque: &dyn Fn(&str) -> Result<StorePath, BadStorePath>) -> Result<Self, BadStorePath> {
    match s.rsplit_once('^') {
      None => Ok(Self::Opaque(opaque(s)?)),
      Some((drv, output)) => {
        if OutputsSpec::parse(output).is_err() || output.contains(',') || output == "*" {
          return Err(BadStorePath {
            path: s.to_string(),
            reason: format!("'{output}' is not a single output name"),
          });
        }
        Ok(Self::built(Self::parse_with(drv, opaque)?, output))
      }
    }
  }

  /// The store path at the bottom of the chain.
  pub fn base_store_path(&self) -> &StorePath {
    match self {
      Self::Opaque(path) => path,
      Self::Built { drv_path, .. } => drv_path.base_store_path(),
    }
  }

  pub fn render(&self, store_dir: &StoreDir) -> String {
    match self {
      Self::Opaque(path) => store_dir.print_path(path),
      Self::Built { drv_path, output } => format!("{}^{}", drv_path.render(store_dir), output),
    }
  }
}

impl fmt::Display for SingleDerivedPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Opaque(path) => write!(f, "{path}"),
      Self::Built { drv_path, output } => write!(f, "{drv_path}^{output}"),
    }
  }
}

impl TryFrom<String> for SingleDerivedPath {
  type Error = BadStorePath;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse_base_name(&value)
  }
}

impl From<SingleDerivedPath> for String {
  fn from(value: SingleDerivedPath) -> Self {
    value.to_string()
  }
}

/// What a consumer wants realized: an existing path, or a set of outputs of
/// a (possibly dynamic) derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivedPath {
  Opaque(StorePath),
  Built {
    drv_path: SingleDerivedPath,
    outputs: OutputsSpec,
  },
}

impl DerivedPath {
  pub fn parse(store_dir: &StoreDir, s: &str) -> Result<Self, BadStorePath> {
    match s.rsplit_once('^') {
      None => Ok(Self::Opaque(store_dir.parse_path(s)?)),
      Some((drv, outputs)) => Ok(Self::Built {
        drv_path: SingleDerivedPath::parse(store_dir, drv)?,
        outputs: OutputsSpec::parse(outputs).map_err(|e| BadStorePath {
          path: s.to_string(),
          reason: e.to_string(),
        })?,
      }),
    }
  }

  pub fn from_single(path: SingleDerivedPath) -> Self {
    match path {
      SingleDerivedPath::Opaque(path) => Self::Opaque(path),
      SingleDerivedPath::Built { drv_path, output } => Self::Built {
        drv_path: *drv_path,
        outputs: OutputsSpec::names([output]),
      },
    }
  }

  pub fn base_store_path(&self) -> &StorePath {
    match self {
      Self::Opaque(path) => path,
      Self::Built { drv_path, .. } => drv_path.base_store_path(),
    }
  }

  pub fn render(&self, store_dir: &StoreDir) -> String {
    match self {
      Self::Opaque(path) => store_dir.print_path(path),
      Self::Built { drv_path, outputs } => format!("{}^{}", drv_path.render(store_dir), outputs),
    }
  }
}

impl fmt::Display for DerivedPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Opaque(path) => write!(f, "{path}"),
      Self::Built { drv_path, outputs } => write!(f, "{drv_path}^{outputs}"),
    }
  }
}
