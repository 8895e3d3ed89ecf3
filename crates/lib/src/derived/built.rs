//! Realized counterparts of derived paths.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};

use super::{OutputName, SingleDerivedPath};
use crate::store::path::{StoreDir, StorePath};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SingleBuiltPath {
  Opaque(StorePath),
  Built {
    drv_path: Box<SingleBuiltPath>,
    output: (OutputName, StorePath),
  },
}

impl SingleBuiltPath {
  pub fn out_path(&self) -> &StorePath {
    match self {
      Self::Opaque(path) => path,
      Self::Built { output, .. } => &output.1,
    }
  }

  pub fn discard_output_path(&self) -> SingleDerivedPath {
    match self {
      Self::Opaque(path) => SingleDerivedPath::Opaque(path.clone()),
      Self::Built { drv_path, output } => SingleDerivedPath::built(drv_path.discard_output_path(), output.0.clone()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuiltPath {
  Opaque(StorePath),
  Built {
    drv_path: SingleBuiltPath,
    outputs: BTreeMap<OutputName, StorePath>,
  },
}

impl BuiltPath {
  pub fn out_paths(&self) -> BTreeSet<StorePath> {
    match self {
      Self::Opaque(path) => BTreeSet::from([path.clone()]),
      Self::Built { outputs, .. } => outputs.values().cloned().collect(),
    }
  }

  pub fn to_json(&self, store_dir: &StoreDir) -> Value {
    match self {
      Self::Opaque(path) => json!({ "path": store_dir.print_path(path) }),
      Self::Built { drv_path, outputs } => {
        let outputs: serde_json::Map<String, Value> = outputs
          .iter()
          .map(|(name, path)| (name.clone(), Value::String(store_dir.print_path(path))))
          .collect();
        json!({
          "drvPath": store_dir.print_path(drv_path.out_path()),
          "outputs": outputs,
        })
      }
    }
  }
}
