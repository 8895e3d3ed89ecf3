//! Modifying the value of an installable before it is resolved:
//! `--apply`, `--override`, `--override-attrs` and `--with-packages`.
//!
//! One kind of modification is honored per invocation, in that order of
//! precedence. The result is a new installable over the modified value;
//! the original is left as is.

use std::collections::BTreeMap;

use mlua::prelude::*;
use tracing::{debug, warn};

use super::{Installable, InstallableAttrPath, InstallableError};
use crate::eval::{EvalCache, EvalError, EvalState};

/// Where the value of one `--override` argument comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideArg {
  /// An expression, `--override name expr`.
  Expr(String),
  /// The value of another installable, `--override-with name flakeref#attr`.
  Installable(String),
  /// An attribute of the loaded file, `--override-from-file name attr`.
  FileAttr(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifiers {
  pub apply: Option<String>,
  pub overrides: BTreeMap<String, OverrideArg>,
  pub override_attrs: Option<String>,
  pub with_packages: Option<String>,
}

impl Modifiers {
  pub fn is_empty(&self) -> bool {
    self.apply.is_none() && self.overrides.is_empty() && self.override_attrs.is_none() && self.with_packages.is_none()
  }

  fn ignored(&self) -> Vec<&'static str> {
    let mut present = Vec::new();
    if self.apply.is_some() {
      present.push("--apply");
    }
    if !self.overrides.is_empty() {
      present.push("--override");
    }
    if self.override_attrs.is_some() {
      present.push("--override-attrs");
    }
    if self.with_packages.is_some() {
      present.push("--with-packages");
    }
    present.into_iter().skip(1).collect()
  }

  /// Apply the modifications to `installable`. `override_value` produces
  /// the value of each `--override` argument.
  pub(super) fn modify(
    &self,
    state: &EvalState,
    installable: &Installable,
    override_value: impl Fn(&OverrideArg) -> Result<LuaValue, InstallableError>,
  ) -> Result<Installable, InstallableError> {
    let Some(target) = installable.as_value() else {
      warn!(installable = %installable.what(), "store paths cannot be modified, ignoring modifiers");
      return Ok(installable.clone());
    };
    let ignored = self.ignored();
    if !ignored.is_empty() {
      warn!(ignored = ?ignored, "only one kind of modification is applied");
    }

    let what = target.what();
    let lua = state.lua();
    let cursor = target.cursor(state)?;
    let source_attr_path = Some(cursor.attr_path_string()).filter(|p| !p.is_empty());
    let value = cursor.value()?;

    let result = if let Some(apply) = &self.apply {
      debug!(installable = %what, "applying function");
      let function = expect_function(state.eval_in_scope(apply, "=--apply", &[])?, "--apply")?;
      call(&function, value)?
    } else if !self.overrides.is_empty() {
      let function = capability(&value, "override").ok_or_else(|| InstallableError::NotOverridable(what.clone()))?;
      let args = lua.create_table().map_err(EvalError::from)?;
      for (name, arg) in &self.overrides {
        args.set(name.as_str(), override_value(arg)?).map_err(EvalError::from)?;
      }
      debug!(installable = %what, overrides = self.overrides.len(), "overriding arguments");
      call(&function, LuaValue::Table(args))?
    } else if let Some(expr) = &self.override_attrs {
      let function =
        capability(&value, "overrideAttrs").ok_or_else(|| InstallableError::NotOverrideAttrsCapable(what.clone()))?;
      let changes = state.eval_in_scope(&format!("function(old) return ({expr}) end"), "=--override-attrs", &[])?;
      call(&function, changes)?
    } else if let Some(expr) = &self.with_packages {
      let function =
        capability(&value, "withPackages").ok_or_else(|| InstallableError::NotExtensibleWithPackages(what.clone()))?;
      let select = state.eval_in_scope(&format!("function(ps) return ({expr}) end"), "=--with-packages", &[])?;
      call(&function, select)?
    } else {
      return Ok(installable.clone());
    };

    Ok(Installable::AttrPath(InstallableAttrPath {
      cache: EvalCache::from_value(lua.clone(), result),
      attr_path: String::new(),
      extended_outputs: installable.extended_outputs().clone(),
      name: Some(what),
      origin: target.origin(state)?,
      source_attr_path,
    }))
  }
}

fn capability(value: &LuaValue, name: &str) -> Option<LuaFunction> {
  match value {
    LuaValue::Table(t) => t.get::<LuaFunction>(name).ok(),
    _ => None,
  }
}

fn expect_function(value: LuaValue, what: &str) -> Result<LuaFunction, EvalError> {
  match value {
    LuaValue::Function(f) => Ok(f),
    other => Err(EvalError::TypeError {
      path: what.to_string(),
      expected: "a function",
      actual: other.type_name().to_string(),
    }),
  }
}

fn call(function: &LuaFunction, arg: LuaValue) -> Result<LuaValue, EvalError> {
  Ok(function.call(arg)?)
}
