use std::rc::Rc;

use super::resolve::{ValueContext, resolve_value_tree};
use super::{DerivedPathWithInfo, ExtraPathInfo, FlakeOrigin, InstallableError, InstallableValue};
use crate::derived::ExtendedOutputsSpec;
use crate::eval::{AttrCursor, EvalCache, EvalMode, EvalState, parse_attr_path};

/// An attribute path into a value that was evaluated up front: a file, an
/// expression, or the result of modifying another installable.
#[derive(Clone)]
pub struct InstallableAttrPath {
  pub cache: Rc<EvalCache>,
  pub attr_path: String,
  pub extended_outputs: ExtendedOutputsSpec,
  /// Shown in messages instead of the attribute path.
  pub name: Option<String>,
  pub origin: Option<FlakeOrigin>,
  /// Attribute path of the installable this value was derived from, for
  /// modified installables. Reported in place of the path into `cache`.
  pub source_attr_path: Option<String>,
}

impl InstallableAttrPath {
  pub fn new(cache: Rc<EvalCache>, attr_path: impl Into<String>, extended_outputs: ExtendedOutputsSpec) -> Self {
    Self {
      cache,
      attr_path: attr_path.into(),
      extended_outputs,
      name: None,
      origin: None,
      source_attr_path: None,
    }
  }

  pub fn what(&self) -> String {
    match &self.name {
      Some(name) => name.clone(),
      None => format!("{}{}", self.attr_path, self.extended_outputs),
    }
  }

  pub fn find_cursor(&self) -> Result<AttrCursor, InstallableError> {
    let mut cursor = self.cache.root_cursor();
    for name in parse_attr_path(&self.attr_path)? {
      cursor = cursor.get_attr(&name)?;
    }
    Ok(cursor)
  }

  pub(super) fn to_derived_paths(
    &self,
    state: &EvalState,
    mode: EvalMode,
  ) -> Result<Vec<DerivedPathWithInfo>, InstallableError> {
    let cursor = self.find_cursor()?;
    let context = ValueContext {
      what: self.what(),
      extended_outputs: &self.extended_outputs,
      info: ExtraPathInfo {
        original_ref: self.origin.as_ref().map(|o| o.original_ref.clone()),
        locked_ref: self.origin.as_ref().map(|o| o.locked.flake.locked_ref.clone()),
        ..ExtraPathInfo::default()
      },
    };
    let mut paths = resolve_value_tree(state, &cursor, &context, mode)?;
    if let Some(source) = &self.source_attr_path {
      for path in &mut paths {
        path.info.attr_path = Some(match path.info.attr_path.as_deref() {
          None | Some("") => source.clone(),
          Some(inner) => format!("{source}.{inner}"),
        });
      }
    }
    Ok(paths)
  }
}

impl InstallableValue for InstallableAttrPath {
  fn what(&self) -> String {
    InstallableAttrPath::what(self)
  }

  fn cursor(&self, _state: &EvalState) -> Result<AttrCursor, InstallableError> {
    self.find_cursor()
  }

  fn origin(&self, _state: &EvalState) -> Result<Option<FlakeOrigin>, InstallableError> {
    Ok(self.origin.clone())
  }
}
