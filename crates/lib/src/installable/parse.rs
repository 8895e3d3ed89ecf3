//! Parsing installable strings.
//!
//! The outputs suffix (`^out,dev`, `^*`) is split off first. The rest is
//! read as, in order:
//! 1. a literal store or derived path, if it contains a `/`;
//! 2. an attribute path into the loaded file or expression, if there is one;
//! 3. `[flakeref][#fragment]`, where a bare attribute path `foo` means
//!    `flake:default#foo`.
//!
//! When nothing matches, the first error encountered is returned.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::LazyLock;

use mlua::prelude::*;
use regex::Regex;
use tracing::debug;

use super::{
  Installable, InstallableAttrPath, InstallableDerivedPath, InstallableError, InstallableFlake, Modifiers, OverrideArg,
  default_flake_attr_path_prefixes, default_flake_attr_paths,
};
use crate::derived::ExtendedOutputsSpec;
use crate::eval::{AutoArgs, EvalCache, EvalState};
use crate::flake::{FlakeRef, LockFlags, parse_flake_ref_with_fragment};

static ATTR_PATH_LIKE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"^[a-zA-Z0-9_"-][a-zA-Z0-9_".,^*-]*$"#).expect("valid attribute path regex"));

/// Where bare attribute paths are looked up instead of flakes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceExprArgs {
  /// `--file`; `-` reads standard input.
  pub file: Option<PathBuf>,
  /// `--expr`
  pub expr: Option<String>,
  /// `--call-package`
  pub call_package: Option<PathBuf>,
  /// `--arg` and `--argstr`
  pub auto_args: AutoArgs,
}

impl SourceExprArgs {
  pub fn is_empty(&self) -> bool {
    self.file.is_none() && self.expr.is_none() && self.call_package.is_none()
  }

  pub fn validate(&self) -> Result<(), InstallableError> {
    let given = [self.file.is_some(), self.expr.is_some(), self.call_package.is_some()];
    if given.iter().filter(|g| **g).count() > 1 {
      return Err(InstallableError::usage(
        "'--file', '--expr' and '--call-package' are exclusive",
      ));
    }
    Ok(())
  }
}

pub struct InstallableParser<'a> {
  state: &'a EvalState,
  cwd: PathBuf,
  source: SourceExprArgs,
  modifiers: Modifiers,
  lock_flags: LockFlags,
  default_attr_paths: Vec<String>,
  prefixes: Vec<String>,
  apply_modifiers: bool,
  context: RefCell<Option<Rc<EvalCache>>>,
}

impl<'a> InstallableParser<'a> {
  pub fn new(state: &'a EvalState, cwd: impl Into<PathBuf>) -> Self {
    let system = state.settings().system.clone();
    Self {
      state,
      cwd: cwd.into(),
      source: SourceExprArgs::default(),
      modifiers: Modifiers::default(),
      lock_flags: LockFlags::default(),
      default_attr_paths: default_flake_attr_paths(&system),
      prefixes: default_flake_attr_path_prefixes(&system),
      apply_modifiers: true,
      context: RefCell::new(None),
    }
  }

  pub fn with_source(mut self, source: SourceExprArgs) -> Self {
    self.source = source;
    self
  }

  pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
    self.modifiers = modifiers;
    self
  }

  pub fn with_lock_flags(mut self, lock_flags: LockFlags) -> Self {
    self.lock_flags = lock_flags;
    self
  }

  /// Replace the attribute paths tried for flake references.
  pub fn with_attr_paths(mut self, default_attr_paths: Vec<String>, prefixes: Vec<String>) -> Self {
    self.default_attr_paths = default_attr_paths;
    self.prefixes = prefixes;
    self
  }

  /// Whether modifiers are applied to parsed installables. Commands that
  /// read installables without building them turn this off.
  pub fn apply_modifiers(mut self, apply: bool) -> Self {
    self.apply_modifiers = apply;
    self
  }

  pub fn parse<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<Installable>, InstallableError> {
    self.source.validate()?;
    args.iter().map(|s| self.parse_one(s.as_ref())).collect()
  }

  pub fn parse_one(&self, s: &str) -> Result<Installable, InstallableError> {
    let installable = self.parse_unmodified(s)?;
    if !self.apply_modifiers || self.modifiers.is_empty() {
      return Ok(installable);
    }
    self
      .modifiers
      .modify(self.state, &installable, |arg| self.override_value(arg))
  }

  fn parse_unmodified(&self, s: &str) -> Result<Installable, InstallableError> {
    let (prefix, extended_outputs) = ExtendedOutputsSpec::parse(s)?;
    let mut first_error = None;

    if prefix.contains('/') {
      match InstallableDerivedPath::parse(self.state.store_dir(), prefix, extended_outputs.clone()) {
        Ok(installable) => {
          debug!(installable = %s, "parsed store path");
          return Ok(Installable::DerivedPath(installable));
        }
        Err(e @ InstallableError::BadStorePath(_)) => {
          debug!(installable = %s, error = %e, "not a store path");
        }
        Err(e) => first_error = Some(e),
      }
    }

    if !self.source.is_empty() {
      let context = self.context()?;
      return Ok(Installable::AttrPath(InstallableAttrPath::new(context, prefix, extended_outputs)));
    }

    let flake_ref = if ATTR_PATH_LIKE.is_match(prefix) {
      format!("flake:default#{prefix}")
    } else {
      prefix.to_string()
    };
    match parse_flake_ref_with_fragment(&flake_ref, Some(&self.cwd)) {
      Ok((flake_ref, fragment)) => Ok(Installable::Flake(self.flake_installable(flake_ref, fragment, extended_outputs))),
      Err(e) => Err(first_error.unwrap_or(e.into())),
    }
  }

  fn flake_installable(&self, flake_ref: FlakeRef, fragment: String, extended_outputs: ExtendedOutputsSpec) -> InstallableFlake {
    InstallableFlake::new(
      flake_ref,
      fragment,
      extended_outputs,
      self.default_attr_paths.clone(),
      self.prefixes.clone(),
      self.lock_flags.clone(),
    )
  }

  /// The value of `--file`/`--expr`/`--call-package`, evaluated once.
  fn context(&self) -> Result<Rc<EvalCache>, InstallableError> {
    if let Some(context) = self.context.borrow().as_ref() {
      return Ok(Rc::clone(context));
    }
    let state = self.state;
    let auto_args = &self.source.auto_args;
    let value = if let Some(file) = &self.source.file {
      let path = self.absolute(file);
      debug!(file = %path.display(), "evaluating file");
      state.eval_file(&path, auto_args)?
    } else if let Some(expr) = &self.source.expr {
      state.eval_expr(expr, auto_args)?
    } else if let Some(file) = &self.source.call_package {
      let path = self.absolute(file);
      debug!(file = %path.display(), "calling package");
      state.call_package(&path, self.default_packages()?, auto_args)?
    } else {
      return Err(InstallableError::usage("no file or expression to evaluate"));
    };
    let context = EvalCache::from_value(state.lua().clone(), value);
    *self.context.borrow_mut() = Some(Rc::clone(&context));
    Ok(context)
  }

  fn absolute(&self, path: &Path) -> PathBuf {
    if path == Path::new("-") || path.is_absolute() {
      path.to_path_buf()
    } else {
      self.cwd.join(path)
    }
  }

  /// `packages.<system>` of the default flake, handed to `--call-package`.
  fn default_packages(&self) -> Result<LuaValue, InstallableError> {
    let system = &self.state.settings().system;
    let packages = self.flake_installable(
      FlakeRef::indirect("default"),
      format!(".packages.{system}"),
      ExtendedOutputsSpec::Default,
    );
    Ok(packages.find_cursor(self.state)?.0.value()?)
  }

  fn override_value(&self, arg: &OverrideArg) -> Result<LuaValue, InstallableError> {
    match arg {
      OverrideArg::Expr(expr) => Ok(self.state.eval_expr(expr, &AutoArgs::new())?),
      OverrideArg::Installable(s) => {
        let (flake_ref, fragment) = parse_flake_ref_with_fragment(s, Some(&self.cwd))?;
        let installable = self.flake_installable(flake_ref, fragment, ExtendedOutputsSpec::Default);
        Ok(installable.find_cursor(self.state)?.0.value()?)
      }
      OverrideArg::FileAttr(attr_path) => {
        if self.source.is_empty() {
          return Err(InstallableError::usage("no file to reference override from"));
        }
        let installable = InstallableAttrPath::new(self.context()?, attr_path.as_str(), ExtendedOutputsSpec::Default);
        Ok(installable.find_cursor()?.value()?)
      }
    }
  }
}
