use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::StoreError;
use super::path::StorePath;
use crate::derived::{OutputName, SingleDerivedPath};
use crate::util::hash::{Hashable, ObjectHash};

/// A build step the store can realize.
///
/// The derivation's own path is the truncated hash of its JSON form, and
/// each output path is derived from the derivation path and output name, so
/// every path is known before anything is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
  pub name: String,
  pub system: String,
  /// Shell script run with `/bin/sh -c`.
  pub builder: String,
  pub outputs: BTreeSet<OutputName>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  /// Derivations (possibly dynamic) whose outputs must exist first.
  #[serde(default)]
  pub input_drvs: BTreeMap<SingleDerivedPath, BTreeSet<OutputName>>,
  #[serde(default)]
  pub input_srcs: BTreeSet<StorePath>,
}

impl Hashable for Derivation {}

impl Derivation {
  pub fn path(&self) -> Result<StorePath, StoreError> {
    let hash = self.compute_hash()?;
    Ok(StorePath::new(&hash, &format!("{}.drv", self.name))?)
  }

  pub fn output_path(&self, drv_path: &StorePath, output: &str) -> Result<StorePath, StoreError> {
    let hash = ObjectHash::of_str(&format!("output:{output}:{drv_path}"));
    let name = if output == "out" {
      self.name.clone()
    } else {
      format!("{}-{}", self.name, output)
    };
    Ok(StorePath::new(&hash, &name)?)
  }

  pub fn output_paths(&self, drv_path: &StorePath) -> Result<BTreeMap<OutputName, StorePath>, StoreError> {
    self
      .outputs
      .iter()
      .map(|output| Ok((output.clone(), self.output_path(drv_path, output)?)))
      .collect()
  }

  pub fn validate(&self) -> Result<(), StoreError> {
    let invalid = |message: String| StoreError::InvalidDerivation {
      name: self.name.clone(),
      message,
    };
    if self.outputs.is_empty() {
      return Err(invalid("derivation has no outputs".to_string()));
    }
    if let Some(bad) = self
      .outputs
      .iter()
      .find(|o| crate::derived::OutputsSpec::parse(o).is_err() || o.contains(','))
    {
      return Err(invalid(format!("invalid output name '{bad}'")));
    }
    if self.builder.trim().is_empty() {
      return Err(invalid("builder is empty".to_string()));
    }
    Ok(())
  }
}
