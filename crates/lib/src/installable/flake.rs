use std::rc::Rc;

use tracing::debug;

use super::resolve::{ValueContext, resolve_value};
use super::{DerivedPathWithInfo, ExtraPathInfo, FlakeOrigin, InstallableError, InstallableValue};
use crate::derived::ExtendedOutputsSpec;
use crate::eval::{AttrCursor, EvalMode, EvalState, OrSuggestions, Suggestions, parse_attr_path};
use crate::flake::{FlakeRef, LockFlags, LockedFlake};

/// Attribute paths tried, in order, for a flake reference without a fragment.
pub fn default_flake_attr_paths(system: &str) -> Vec<String> {
  vec![format!("packages.{system}.default"), format!("defaultPackage.{system}")]
}

/// Prefixes tried, in order, in front of a fragment before the fragment itself.
pub fn default_flake_attr_path_prefixes(system: &str) -> Vec<String> {
  vec![format!("packages.{system}."), format!("legacyPackages.{system}.")]
}

/// An attribute of a flake's outputs, `<flakeref>#<fragment>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallableFlake {
  pub flake_ref: FlakeRef,
  pub fragment: String,
  pub extended_outputs: ExtendedOutputsSpec,
  /// Tried when the fragment is empty.
  pub default_attr_paths: Vec<String>,
  /// Tried in front of a non-empty fragment.
  pub prefixes: Vec<String>,
  pub lock_flags: LockFlags,
}

impl InstallableFlake {
  pub fn new(
    flake_ref: FlakeRef,
    fragment: impl Into<String>,
    extended_outputs: ExtendedOutputsSpec,
    default_attr_paths: Vec<String>,
    prefixes: Vec<String>,
    lock_flags: LockFlags,
  ) -> Self {
    Self {
      flake_ref,
      fragment: fragment.into(),
      extended_outputs,
      default_attr_paths,
      prefixes,
      lock_flags,
    }
  }

  pub fn what(&self) -> String {
    format!("{}#{}{}", self.flake_ref, self.fragment, self.extended_outputs)
  }

  /// Candidate attribute paths in the order they are tried. A fragment
  /// starting with `.` is taken as an exact path from the root.
  pub fn attr_paths(&self) -> Vec<String> {
    if let Some(exact) = self.fragment.strip_prefix('.') {
      return vec![exact.to_string()];
    }
    if self.fragment.is_empty() {
      return self.default_attr_paths.clone();
    }
    self
      .prefixes
      .iter()
      .map(|prefix| format!("{prefix}{}", self.fragment))
      .chain(std::iter::once(self.fragment.clone()))
      .collect()
  }

  pub fn lock(&self, state: &EvalState) -> Result<Rc<LockedFlake>, InstallableError> {
    Ok(state.locker().lock(&self.flake_ref, &self.lock_flags)?)
  }

  /// The first candidate attribute that exists, with the flake it was found in.
  pub fn find_cursor(&self, state: &EvalState) -> Result<(AttrCursor, Rc<LockedFlake>), InstallableError> {
    let locked = self.lock(state)?;
    let root = state.open_eval_cache(&locked).root_cursor();

    let candidates = self.attr_paths();
    let mut suggestions = Suggestions::default();
    for candidate in &candidates {
      let path = parse_attr_path(candidate)?;
      match root.find_along_attr_path(&path)? {
        OrSuggestions::Value(cursor) => {
          debug!(flake = %locked.flake.locked_ref, attr = %candidate, "found flake attribute");
          return Ok((cursor, locked));
        }
        OrSuggestions::Suggestions(found) => suggestions.extend(found),
      }
    }

    Err(InstallableError::AttrNotFound {
      flake_ref: self.flake_ref.to_string(),
      attr_paths: quote_alternatives(&candidates),
      suggestions,
    })
  }

  pub(super) fn to_derived_paths(
    &self,
    state: &EvalState,
    mode: EvalMode,
  ) -> Result<Vec<DerivedPathWithInfo>, InstallableError> {
    let (cursor, locked) = self.find_cursor(state)?;
    let context = ValueContext {
      what: self.what(),
      extended_outputs: &self.extended_outputs,
      info: ExtraPathInfo {
        original_ref: Some(self.flake_ref.clone()),
        locked_ref: Some(locked.flake.locked_ref.clone()),
        ..ExtraPathInfo::default()
      },
    };
    Ok(vec![resolve_value(state, &cursor, &context, mode)?])
  }
}

impl InstallableValue for InstallableFlake {
  fn what(&self) -> String {
    InstallableFlake::what(self)
  }

  fn cursor(&self, state: &EvalState) -> Result<AttrCursor, InstallableError> {
    Ok(self.find_cursor(state)?.0)
  }

  fn origin(&self, state: &EvalState) -> Result<Option<FlakeOrigin>, InstallableError> {
    Ok(Some(FlakeOrigin {
      original_ref: self.flake_ref.clone(),
      locked: self.lock(state)?,
    }))
  }
}

/// `'a'`, `'a' or 'b'`, `'a', 'b' or 'c'`.
fn quote_alternatives(paths: &[String]) -> String {
  let quoted: Vec<String> = paths.iter().map(|p| format!("'{p}'")).collect();
  match quoted.as_slice() {
    [] => String::new(),
    [only] => only.clone(),
    [init @ .., last] => format!("{} or {last}", init.join(", ")),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::derived::{DerivedPath, OutputsSpec};
  use crate::util::testutil::{TestStore, eval_state, flake_fixture};

  const HELLO: &str = r#"
return {
  outputs = function(inputs)
    local hello = derivation { name = "hello", builder = "echo hi > $out" }
    local other = derivation { name = "other", builder = "echo other > $out" }
    return {
      packages = { ["x86_64-linux"] = { default = hello, hello = hello } },
      defaultPackage = { ["x86_64-linux"] = other },
      legacyPackages = { ["x86_64-linux"] = { legacy = other } },
      other = other,
    }
  end,
}
"#;

  fn installable(flake_ref: FlakeRef, fragment: &str) -> InstallableFlake {
    InstallableFlake::new(
      flake_ref,
      fragment,
      ExtendedOutputsSpec::Default,
      default_flake_attr_paths("x86_64-linux"),
      default_flake_attr_path_prefixes("x86_64-linux"),
      LockFlags::default(),
    )
  }

  mod candidates {
    use super::*;

    #[test]
    fn empty_fragment_uses_defaults_in_order() {
      let i = installable(FlakeRef::path("/f"), "");
      assert_eq!(i.attr_paths(), vec!["packages.x86_64-linux.default", "defaultPackage.x86_64-linux"]);
    }

    #[test]
    fn fragment_is_tried_under_each_prefix_then_bare() {
      let i = installable(FlakeRef::path("/f"), "hello");
      assert_eq!(
        i.attr_paths(),
        vec!["packages.x86_64-linux.hello", "legacyPackages.x86_64-linux.hello", "hello"]
      );
    }

    #[test]
    fn leading_dot_is_exact() {
      let i = installable(FlakeRef::path("/f"), ".packages.x86_64-linux.hello");
      assert_eq!(i.attr_paths(), vec!["packages.x86_64-linux.hello"]);
    }

    #[test]
    fn alternatives_are_listed_naturally() {
      let paths = ["a", "b", "c"].map(String::from);
      assert_eq!(quote_alternatives(&paths), "'a', 'b' or 'c'");
      assert_eq!(quote_alternatives(&paths[..1]), "'a'");
    }
  }

  mod resolution {
    use super::*;

    #[test]
    fn default_package_wins_over_legacy_default() {
      let fixture = flake_fixture();
      fixture.write("hello", HELLO);
      let state = eval_state(Rc::new(TestStore::new()));

      let (cursor, _) = installable(fixture.flake_ref("hello"), "").find_cursor(&state).unwrap();
      assert_eq!(cursor.attr_path_string(), "packages.x86_64-linux.default");
    }

    #[test]
    fn prefixes_come_before_the_bare_fragment() {
      let fixture = flake_fixture();
      fixture.write("hello", HELLO);
      let state = eval_state(Rc::new(TestStore::new()));

      let (cursor, _) = installable(fixture.flake_ref("hello"), "legacy").find_cursor(&state).unwrap();
      assert_eq!(cursor.attr_path_string(), "legacyPackages.x86_64-linux.legacy");
      let (cursor, _) = installable(fixture.flake_ref("hello"), "other").find_cursor(&state).unwrap();
      assert_eq!(cursor.attr_path_string(), "other");
    }

    #[test]
    fn derived_path_carries_provenance() {
      let fixture = flake_fixture();
      fixture.write("hello", HELLO);
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());

      let paths = installable(fixture.flake_ref("hello"), "hello")
        .to_derived_paths(&state, EvalMode::default())
        .unwrap();
      assert_eq!(paths.len(), 1);
      let DerivedPath::Built { outputs, .. } = &paths[0].path else {
        panic!("expected a built path");
      };
      assert_eq!(outputs, &OutputsSpec::names(["out"]));
      assert_eq!(paths[0].info.original_ref, Some(fixture.flake_ref("hello")));
      assert!(paths[0].info.locked_ref.is_some());
      assert_eq!(paths[0].info.attr_path.as_deref(), Some("packages.x86_64-linux.hello"));
      assert_eq!(store.derivation_count(), 1);
    }

    #[test]
    fn missing_attribute_names_every_candidate() {
      let fixture = flake_fixture();
      fixture.write("hello", HELLO);
      let state = eval_state(Rc::new(TestStore::new()));

      let err = installable(fixture.flake_ref("hello"), "helo").find_cursor(&state).unwrap_err();
      let msg = err.to_string();
      assert!(msg.contains("'packages.x86_64-linux.helo', 'legacyPackages.x86_64-linux.helo' or 'helo'"));
      assert!(msg.contains("Did you mean 'hello'?"));
    }
  }
}
