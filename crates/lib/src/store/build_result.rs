use std::collections::BTreeMap;

use serde::Serialize;

use super::StoreError;
use super::path::StorePath;
use crate::derived::{DerivedPath, OutputName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildStatus {
  Built,
  AlreadyValid,
  PermanentFailure,
  OutputRejected,
  NotDeterministic,
  DependencyFailed,
  MiscFailure,
}

impl BuildStatus {
  pub fn is_success(self) -> bool {
    matches!(self, Self::Built | Self::AlreadyValid)
  }
}

/// A record that one output of one derivation lives at `out_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Realisation {
  pub drv_path: StorePath,
  pub output: OutputName,
  pub out_path: StorePath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
  pub status: BuildStatus,
  pub error_msg: String,
  pub times_built: u32,
  pub built_outputs: BTreeMap<OutputName, Realisation>,
}

impl BuildResult {
  pub fn new(status: BuildStatus) -> Self {
    Self {
      status,
      error_msg: String::new(),
      times_built: 0,
      built_outputs: BTreeMap::new(),
    }
  }

  pub fn failure(status: BuildStatus, message: impl Into<String>) -> Self {
    Self {
      error_msg: message.into(),
      ..Self::new(status)
    }
  }

  pub fn success(&self) -> bool {
    self.status.is_success()
  }

  /// Turn a failed result back into the error it describes.
  pub fn rethrow(&self, path: &str) -> Result<(), StoreError> {
    if self.success() {
      return Ok(());
    }
    Err(StoreError::BuildFailed {
      path: path.to_string(),
      status: self.status,
      message: self.error_msg.clone(),
    })
  }
}

/// A build result tagged with the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedBuildResult {
  pub path: DerivedPath,
  pub result: BuildResult,
}
