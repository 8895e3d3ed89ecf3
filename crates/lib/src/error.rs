//! Errors surfaced by installable resolution and building.

use thiserror::Error;

use crate::derived::OutputsSpecError;
use crate::eval::{EvalError, Suggestions};
use crate::flake::{FlakeError, FlakeRefError};
use crate::store::{BadStorePath, StoreError};

#[derive(Debug, Error)]
pub enum InstallableError {
  /// Conflicting flags or a result of the wrong shape.
  #[error("{0}")]
  Usage(String),

  #[error(transparent)]
  BadStorePath(#[from] BadStorePath),

  #[error(transparent)]
  OutputsSpec(#[from] OutputsSpecError),

  #[error(transparent)]
  FlakeRef(#[from] FlakeRefError),

  #[error(transparent)]
  Flake(#[from] FlakeError),

  #[error(transparent)]
  Eval(#[from] EvalError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("flake '{flake_ref}' does not provide attribute {attr_paths}{}", suggestion_suffix(.suggestions))]
  AttrNotFound {
    flake_ref: String,
    attr_paths: String,
    suggestions: Suggestions,
  },

  #[error("{0} is not overridable")]
  NotOverridable(String),

  #[error("{0} is not overrideAttrs-capable")]
  NotOverrideAttrsCapable(String),

  #[error("{0} cannot be extended with additional packages")]
  NotExtensibleWithPackages(String),

  #[error("argument '{0}' did not evaluate to a derivation")]
  NotADerivation(String),

  #[error("'{0}' does not evaluate to a derivation or a store path")]
  NotDerivationOrPath(String),

  #[error("'{0}' does not have a known deriver")]
  NoDeriver(String),

  #[error("argument '{0}' should evaluate to one store path")]
  NotOneStorePath(String),

  #[error("installable '{what}' evaluates to {count} derivations, where only one is expected")]
  NotOneDerivedPath { what: String, count: usize },
}

impl InstallableError {
  pub fn usage(message: impl Into<String>) -> Self {
    Self::Usage(message.into())
  }

  /// Errors caused by how the command was invoked rather than by what was
  /// evaluated or built.
  pub fn is_usage_error(&self) -> bool {
    matches!(self, Self::Usage(_) | Self::NotOneStorePath(_) | Self::NotOneDerivedPath { .. })
  }
}

fn suggestion_suffix(suggestions: &Suggestions) -> String {
  if suggestions.is_empty() {
    String::new()
  } else {
    format!("\n\n{suggestions}")
  }
}
