//! Flattening build results for commands that want plain store paths.

use std::collections::BTreeSet;

use tracing::debug;

use super::build::{Realise, build};
use super::{Installable, InstallableError};
use crate::derived::{BuiltPath, DerivedPath};
use crate::eval::{EvalMode, EvalState};
use crate::store::{BuildMode, Store, StorePath, resolve_drv_path};

/// Whether a command works on outputs or on the derivations producing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperateOn {
  #[default]
  Output,
  Derivation,
}

pub fn to_built_paths(
  state: &EvalState,
  store: &dyn Store,
  mode: Realise,
  operate_on: OperateOn,
  installables: &[Installable],
) -> Result<Vec<BuiltPath>, InstallableError> {
  match operate_on {
    OperateOn::Output => Ok(
      build(state, store, mode, installables, BuildMode::Normal)?
        .into_iter()
        .map(|result| result.path)
        .collect(),
    ),
    OperateOn::Derivation => {
      let eval_mode = EvalMode {
        read_only: mode == Realise::Nothing,
      };
      Ok(
        derivations(state, store, installables, true, eval_mode)?
          .into_iter()
          .map(BuiltPath::Opaque)
          .collect(),
      )
    }
  }
}

pub fn to_store_paths(
  state: &EvalState,
  store: &dyn Store,
  mode: Realise,
  operate_on: OperateOn,
  installables: &[Installable],
) -> Result<BTreeSet<StorePath>, InstallableError> {
  Ok(
    to_built_paths(state, store, mode, operate_on, installables)?
      .iter()
      .flat_map(BuiltPath::out_paths)
      .collect(),
  )
}

/// The one store path `installable` must produce.
pub fn to_store_path(
  state: &EvalState,
  store: &dyn Store,
  mode: Realise,
  operate_on: OperateOn,
  installable: &Installable,
) -> Result<StorePath, InstallableError> {
  let paths = to_store_paths(state, store, mode, operate_on, std::slice::from_ref(installable))?;
  let mut paths = paths.into_iter();
  match (paths.next(), paths.next()) {
    (Some(path), None) => Ok(path),
    _ => Err(InstallableError::NotOneStorePath(installable.what())),
  }
}

/// The derivations that produce `installables`. A store path that is not
/// a derivation is mapped to the derivation recorded as its deriver when
/// `use_deriver` is set.
pub fn to_derivations(
  state: &EvalState,
  store: &dyn Store,
  installables: &[Installable],
  use_deriver: bool,
) -> Result<BTreeSet<StorePath>, InstallableError> {
  derivations(state, store, installables, use_deriver, EvalMode::default())
}

fn derivations(
  state: &EvalState,
  store: &dyn Store,
  installables: &[Installable],
  use_deriver: bool,
  mode: EvalMode,
) -> Result<BTreeSet<StorePath>, InstallableError> {
  let mut drv_paths = BTreeSet::new();
  for installable in installables {
    for path in installable.to_derived_paths(state, mode)? {
      let drv_path = match &path.path {
        DerivedPath::Built { drv_path, .. } => resolve_drv_path(store, drv_path)?,
        DerivedPath::Opaque(p) if p.is_derivation() => p.clone(),
        DerivedPath::Opaque(p) if use_deriver => {
          let derivers = store.query_valid_derivers(p)?;
          let deriver = derivers
            .into_iter()
            .next()
            .ok_or_else(|| InstallableError::NoDeriver(store.store_dir().print_path(p)))?;
          debug!(path = %p, %deriver, "using deriver");
          deriver
        }
        DerivedPath::Opaque(_) => return Err(InstallableError::NotADerivation(installable.what())),
      };
      drv_paths.insert(drv_path);
    }
  }
  Ok(drv_paths)
}

/// Build an installable that must produce exactly one store path, such as
/// a system configuration to activate.
pub fn build_activatable(
  state: &EvalState,
  store: &dyn Store,
  mode: Realise,
  installable: &Installable,
) -> Result<StorePath, InstallableError> {
  let paths = to_store_paths(state, store, mode, OperateOn::Output, std::slice::from_ref(installable))?;
  if paths.len() != 1 {
    return Err(InstallableError::usage(
      "this command requires that the argument produces a single store path",
    ));
  }
  paths
    .into_iter()
    .next()
    .ok_or_else(|| InstallableError::NotOneStorePath(installable.what()))
}

/// Select attribute `attr` of the value an installable points at. Store
/// paths have no attributes and are returned as is.
pub fn with_activation_attr(installable: &Installable, attr: &str) -> Installable {
  let join = |base: &str| {
    if base.is_empty() {
      attr.to_string()
    } else {
      format!("{base}.{attr}")
    }
  };
  match installable {
    Installable::Flake(i) => {
      let mut i = i.clone();
      i.fragment = join(&i.fragment);
      Installable::Flake(i)
    }
    Installable::AttrPath(i) => {
      let mut i = i.clone();
      i.attr_path = join(&i.attr_path);
      i.name = i.name.map(|name| format!("{name}.{attr}"));
      Installable::AttrPath(i)
    }
    Installable::DerivedPath(_) => installable.clone(),
  }
}
