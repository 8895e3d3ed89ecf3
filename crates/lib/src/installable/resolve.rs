//! Turning an evaluated value into derived paths.
//!
//! A derivation resolves to `Built` with the outputs the user asked for or
//! the derivation's own defaults. A string that is a store path, or a sole
//! placeholder for an output, resolves without evaluating a derivation.

use std::collections::BTreeMap;

use tracing::debug;

use super::{DerivedPathWithInfo, ExtraPathInfo, InstallableError};
use crate::derived::{DerivedPath, ExtendedOutputsSpec, OutputsSpec, SingleDerivedPath};
use crate::eval::{AttrCursor, EvalError, EvalMode, EvalState};
use crate::placeholder;

/// What every path resolved from one installable shares.
pub(super) struct ValueContext<'a> {
  pub what: String,
  pub extended_outputs: &'a ExtendedOutputsSpec,
  pub info: ExtraPathInfo,
}

/// Resolve the value at `cursor`, which must be a derivation or a path.
pub(super) fn resolve_value(
  state: &EvalState,
  cursor: &AttrCursor,
  context: &ValueContext<'_>,
  mode: EvalMode,
) -> Result<DerivedPathWithInfo, InstallableError> {
  if cursor.is_derivation()? {
    return resolve_derivation(state, cursor, context, mode);
  }
  match resolve_path_string(state, cursor, mode)? {
    Some(path) => Ok(DerivedPathWithInfo {
      path,
      info: ExtraPathInfo {
        attr_path: Some(cursor.attr_path_string()),
        extended_outputs: context.extended_outputs.clone(),
        ..context.info.clone()
      },
    }),
    None => Err(InstallableError::NotDerivationOrPath(context.what.clone())),
  }
}

/// Like [`resolve_value`], but a set that is not a derivation stands for
/// the derivations inside it. Nested sets are entered only when marked with
/// `recurseForDerivations = true`. Paths to the same derivation are merged.
pub(super) fn resolve_value_tree(
  state: &EvalState,
  cursor: &AttrCursor,
  context: &ValueContext<'_>,
  mode: EvalMode,
) -> Result<Vec<DerivedPathWithInfo>, InstallableError> {
  if cursor.is_derivation()? || !cursor.is_attrs()? {
    return Ok(vec![resolve_value(state, cursor, context, mode)?]);
  }

  let mut found = Vec::new();
  collect_derivations(state, cursor, context, mode, true, &mut found)?;

  let mut merged: Vec<DerivedPathWithInfo> = Vec::new();
  let mut index: BTreeMap<SingleDerivedPath, usize> = BTreeMap::new();
  for path in found {
    let DerivedPath::Built { drv_path, outputs } = &path.path else {
      merged.push(path);
      continue;
    };
    match index.get(drv_path) {
      Some(&i) => {
        if let DerivedPath::Built { outputs: existing, .. } = &mut merged[i].path {
          *existing = existing.union(outputs);
        }
      }
      None => {
        index.insert(drv_path.clone(), merged.len());
        merged.push(path);
      }
    }
  }
  debug!(installable = %context.what, derivations = merged.len(), "resolved attribute set");
  Ok(merged)
}

fn collect_derivations(
  state: &EvalState,
  cursor: &AttrCursor,
  context: &ValueContext<'_>,
  mode: EvalMode,
  top_level: bool,
  found: &mut Vec<DerivedPathWithInfo>,
) -> Result<(), InstallableError> {
  if !top_level && !recurses(cursor)? {
    return Ok(());
  }
  for name in cursor.get_attrs()? {
    let child = cursor.get_attr(&name)?;
    if child.is_derivation()? {
      found.push(resolve_derivation(state, &child, context, mode)?);
    } else if child.is_attrs()? {
      collect_derivations(state, &child, context, mode, false, found)?;
    }
  }
  Ok(())
}

fn recurses(cursor: &AttrCursor) -> Result<bool, EvalError> {
  match cursor.maybe_get_attr("recurseForDerivations")? {
    Some(flag) => match flag.get_bool() {
      Ok(b) => Ok(b),
      Err(EvalError::TypeError { .. }) => Ok(false),
      Err(e) => Err(e),
    },
    None => Ok(false),
  }
}

fn resolve_derivation(
  state: &EvalState,
  cursor: &AttrCursor,
  context: &ValueContext<'_>,
  mode: EvalMode,
) -> Result<DerivedPathWithInfo, InstallableError> {
  let drv_path = state.force_derivation(cursor)?;
  state.write_derivation_closure(&drv_path, mode)?;

  let outputs = match context.extended_outputs {
    ExtendedOutputsSpec::Explicit(spec) => spec.clone(),
    ExtendedOutputsSpec::Default => default_outputs(cursor)?,
  };
  debug!(attr = %cursor.attr_path_string(), drv = %drv_path, %outputs, "resolved derivation");

  Ok(DerivedPathWithInfo {
    path: DerivedPath::Built { drv_path, outputs },
    info: ExtraPathInfo {
      priority: priority(cursor)?,
      attr_path: Some(cursor.attr_path_string()),
      extended_outputs: context.extended_outputs.clone(),
      ..context.info.clone()
    },
  })
}

/// The output a derivation value was selected at (`drv.dev`), else
/// `meta.outputsToInstall`, else `out`.
fn default_outputs(cursor: &AttrCursor) -> Result<OutputsSpec, EvalError> {
  if let Some(specified) = cursor.maybe_get_attr("outputSpecified")?
    && specified.get_bool()?
    && let Some(name) = cursor.maybe_get_attr("outputName")?
  {
    return Ok(OutputsSpec::names([name.get_string()?]));
  }
  if let Some(meta) = cursor.maybe_get_attr("meta")?
    && meta.is_attrs()?
    && let Some(to_install) = meta.maybe_get_attr("outputsToInstall")?
  {
    return Ok(OutputsSpec::names(to_install.get_list_of_strings()?));
  }
  Ok(OutputsSpec::names(["out"]))
}

fn priority(cursor: &AttrCursor) -> Result<Option<i64>, EvalError> {
  let Some(meta) = cursor.maybe_get_attr("meta")? else {
    return Ok(None);
  };
  if !meta.is_attrs()? {
    return Ok(None);
  }
  match meta.maybe_get_attr("priority")? {
    Some(p) => p.get_int().map(Some),
    None => Ok(None),
  }
}

/// A string naming a store path, or standing for an output of a derivation.
fn resolve_path_string(state: &EvalState, cursor: &AttrCursor, mode: EvalMode) -> Result<Option<DerivedPath>, EvalError> {
  let s = match cursor.get_string() {
    Ok(s) => s,
    Err(EvalError::TypeError { .. }) => return Ok(None),
    Err(e) => return Err(e),
  };
  if let Some(path) = placeholder::as_sole_placeholder(&s) {
    state.write_derivation_closure(&path, mode)?;
    return Ok(Some(DerivedPath::from_single(path)));
  }
  Ok(state.store_dir().parse_path(&s).ok().map(DerivedPath::Opaque))
}
