//! Installables: command-line references to things that can be built.
//!
//! An installable is one of:
//! - a store path or derived path literal, `/store/<hash>-foo.drv^out`
//! - an attribute of a flake's outputs, `path:/src#packages.x86_64-linux.hello`
//! - an attribute path into an explicitly loaded file or expression
//!
//! Parsing ([`InstallableParser`]) produces [`Installable`] values, which
//! resolve to [`DerivedPathWithInfo`]s ([`Installable::to_derived_paths`]).
//! [`build`] realizes the derived paths of many installables in one batch,
//! and the projections flatten the results into store paths or derivations.

mod attr_path;
mod build;
mod complete;
mod derived;
mod flake;
mod modify;
mod parse;
mod projections;
mod resolve;

use std::rc::Rc;

pub use attr_path::InstallableAttrPath;
pub use build::{BuiltPathWithResult, Realise, build, build_with_installables};
pub use complete::complete_installable;
pub use derived::InstallableDerivedPath;
pub use flake::{InstallableFlake, default_flake_attr_path_prefixes, default_flake_attr_paths};
pub use modify::{Modifiers, OverrideArg};
pub use parse::{InstallableParser, SourceExprArgs};
pub use projections::{
  OperateOn, build_activatable, to_built_paths, to_derivations, to_store_path, to_store_paths, with_activation_attr,
};

pub use crate::error::InstallableError;
use crate::derived::{DerivedPath, ExtendedOutputsSpec};
use crate::eval::{AttrCursor, EvalMode, EvalState};
use crate::flake::{FlakeRef, LockedFlake};

/// Provenance of a derived path, handed to consumers alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraPathInfo {
  /// `meta.priority` of the derivation, for profile installs.
  pub priority: Option<i64>,
  pub original_ref: Option<FlakeRef>,
  pub locked_ref: Option<FlakeRef>,
  /// The attribute path the value was found at.
  pub attr_path: Option<String>,
  pub extended_outputs: ExtendedOutputsSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPathWithInfo {
  pub path: DerivedPath,
  pub info: ExtraPathInfo,
}

/// Where a flake-derived value came from. Kept by modified installables.
#[derive(Debug, Clone)]
pub struct FlakeOrigin {
  pub original_ref: FlakeRef,
  pub locked: Rc<LockedFlake>,
}

#[derive(Clone)]
pub enum Installable {
  DerivedPath(InstallableDerivedPath),
  Flake(InstallableFlake),
  AttrPath(InstallableAttrPath),
}

impl std::fmt::Debug for Installable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kind = match self {
      Self::DerivedPath(_) => "DerivedPath",
      Self::Flake(_) => "Flake",
      Self::AttrPath(_) => "AttrPath",
    };
    f.debug_tuple(kind).field(&self.what()).finish()
  }
}

impl Installable {
  /// Human readable form for messages.
  pub fn what(&self) -> String {
    match self {
      Self::DerivedPath(i) => i.what(),
      Self::Flake(i) => i.what(),
      Self::AttrPath(i) => i.what(),
    }
  }

  pub fn to_derived_paths(&self, state: &EvalState, mode: EvalMode) -> Result<Vec<DerivedPathWithInfo>, InstallableError> {
    match self {
      Self::DerivedPath(i) => Ok(vec![i.to_derived_path()]),
      Self::Flake(i) => i.to_derived_paths(state, mode),
      Self::AttrPath(i) => i.to_derived_paths(state, mode),
    }
  }

  /// The single derived path this installable must resolve to.
  pub fn to_derived_path(&self, state: &EvalState, mode: EvalMode) -> Result<DerivedPathWithInfo, InstallableError> {
    let mut paths = self.to_derived_paths(state, mode)?;
    if paths.len() != 1 {
      return Err(InstallableError::NotOneDerivedPath {
        what: self.what(),
        count: paths.len(),
      });
    }
    Ok(paths.remove(0))
  }

  pub fn extended_outputs(&self) -> &ExtendedOutputsSpec {
    match self {
      Self::DerivedPath(i) => &i.extended_outputs,
      Self::Flake(i) => &i.extended_outputs,
      Self::AttrPath(i) => &i.extended_outputs,
    }
  }

  /// The evaluated-value view, for installables that have one.
  pub fn as_value(&self) -> Option<&dyn InstallableValue> {
    match self {
      Self::DerivedPath(_) => None,
      Self::Flake(i) => Some(i),
      Self::AttrPath(i) => Some(i),
    }
  }
}

/// Installables backed by an evaluated value, which can be modified.
pub trait InstallableValue {
  fn what(&self) -> String;

  /// The cursor the installable resolves to.
  fn cursor(&self, state: &EvalState) -> Result<AttrCursor, InstallableError>;

  /// The flake the value came from, if any.
  fn origin(&self, state: &EvalState) -> Result<Option<FlakeOrigin>, InstallableError>;
}
