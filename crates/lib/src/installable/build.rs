//! Realizing installables.
//!
//! All installables are resolved first; identical derived paths are
//! requested once and every installable asking for one gets its own copy
//! of the result.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use super::{ExtraPathInfo, Installable, InstallableError};
use crate::derived::{BuiltPath, DerivedPath, OutputName, SingleBuiltPath, SingleDerivedPath};
use crate::eval::{EvalMode, EvalState};
use crate::store::{BuildMode, BuildResult, BuildStatus, Store, StoreError, StorePath};

/// How far to take the installables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Realise {
  /// Build the requested outputs.
  #[default]
  Outputs,
  /// Write the derivations and report what is missing, without building.
  Derivation,
  /// Only evaluate; nothing is written to the store.
  Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPathWithResult {
  pub path: BuiltPath,
  pub info: ExtraPathInfo,
  /// Only set when outputs were built.
  pub result: Option<BuildResult>,
}

/// Realize `installables` and return the results in installable order.
pub fn build(
  state: &EvalState,
  store: &dyn Store,
  mode: Realise,
  installables: &[Installable],
  build_mode: BuildMode,
) -> Result<Vec<BuiltPathWithResult>, InstallableError> {
  Ok(
    build_with_installables(state, store, mode, installables, build_mode)?
      .into_iter()
      .map(|(_, result)| result)
      .collect(),
  )
}

/// Like [`build`], tagging each result with the index of the installable
/// it belongs to.
pub fn build_with_installables(
  state: &EvalState,
  store: &dyn Store,
  mode: Realise,
  installables: &[Installable],
  build_mode: BuildMode,
) -> Result<Vec<(usize, BuiltPathWithResult)>, InstallableError> {
  let eval_mode = EvalMode {
    read_only: mode == Realise::Nothing,
  };

  let mut paths: Vec<DerivedPath> = Vec::new();
  let mut requesters: Vec<Vec<(usize, ExtraPathInfo)>> = Vec::new();
  let mut index: HashMap<DerivedPath, usize> = HashMap::new();
  for (i, installable) in installables.iter().enumerate() {
    for path in installable.to_derived_paths(state, eval_mode)? {
      let slot = *index.entry(path.path.clone()).or_insert_with(|| {
        paths.push(path.path.clone());
        requesters.push(Vec::new());
        paths.len() - 1
      });
      requesters[slot].push((i, path.info));
    }
  }
  debug!(
    installables = installables.len(),
    paths = paths.len(),
    ?mode,
    "resolved installables"
  );

  let resolver = BuiltPathResolver::new(store, state.store().as_ref());
  let mut results = Vec::new();
  match mode {
    Realise::Nothing | Realise::Derivation => {
      if mode == Realise::Derivation {
        let missing = store.query_missing(&paths)?;
        if !missing.is_empty() {
          info!(
            will_build = missing.will_build.len(),
            unknown = missing.unknown.len(),
            "outputs are missing"
          );
        }
      }
      for (path, requesters) in paths.iter().zip(requesters) {
        let built = resolver.without_building(path)?;
        for (i, info) in requesters {
          results.push((
            i,
            BuiltPathWithResult {
              path: built.clone(),
              info,
              result: None,
            },
          ));
        }
      }
    }
    Realise::Outputs => {
      let outcomes = realize(store, state.store().as_ref(), &paths, build_mode)?;
      for ((path, requesters), result) in paths.iter().zip(requesters).zip(outcomes) {
        result.rethrow(&path.render(store.store_dir()))?;
        let built = resolver.from_result(path, &result)?;
        for (i, info) in requesters {
          results.push((
            i,
            BuiltPathWithResult {
              path: built.clone(),
              info,
              result: Some(result.clone()),
            },
          ));
        }
      }
    }
  }

  results.sort_by_key(|(i, _)| *i);
  Ok(results)
}

/// One build request for everything that needs building, in `paths` order.
/// Store paths are only checked for validity.
fn realize(
  store: &dyn Store,
  eval_store: &dyn Store,
  paths: &[DerivedPath],
  build_mode: BuildMode,
) -> Result<Vec<BuildResult>, StoreError> {
  let to_build: Vec<DerivedPath> = paths
    .iter()
    .filter(|p| matches!(p, DerivedPath::Built { .. }))
    .cloned()
    .collect();
  let mut built: HashMap<DerivedPath, BuildResult> = HashMap::new();
  if !to_build.is_empty() {
    info!(paths = to_build.len(), ?build_mode, "building");
    for keyed in store.build_paths_with_results(&to_build, build_mode, eval_store)? {
      built.insert(keyed.path, keyed.result);
    }
  }

  paths
    .iter()
    .map(|path| match path {
      DerivedPath::Opaque(p) if store.is_valid_path(p) => Ok(BuildResult::new(BuildStatus::AlreadyValid)),
      DerivedPath::Opaque(p) => Ok(BuildResult::failure(
        BuildStatus::MiscFailure,
        format!("path '{}' is not valid", store.store_dir().print_path(p)),
      )),
      DerivedPath::Built { .. } => built.remove(path).ok_or_else(|| {
        StoreError::Runtime(format!("no build result for '{}'", path.render(store.store_dir())))
      }),
    })
    .collect()
}

/// Maps derived paths to the store paths they denote. Derivation paths
/// are resolved once per call.
struct BuiltPathResolver<'a> {
  store: &'a dyn Store,
  eval_store: &'a dyn Store,
  drv_paths: RefCell<BTreeMap<SingleDerivedPath, SingleBuiltPath>>,
}

impl<'a> BuiltPathResolver<'a> {
  fn new(store: &'a dyn Store, eval_store: &'a dyn Store) -> Self {
    Self {
      store,
      eval_store,
      drv_paths: RefCell::new(BTreeMap::new()),
    }
  }

  fn without_building(&self, path: &DerivedPath) -> Result<BuiltPath, StoreError> {
    match path {
      DerivedPath::Opaque(p) => Ok(BuiltPath::Opaque(p.clone())),
      DerivedPath::Built { drv_path, outputs } => {
        let drv_path = self.drv_path(drv_path)?;
        let outputs = self
          .output_map(drv_path.out_path())?
          .into_iter()
          .filter(|(name, _)| outputs.contains(name))
          .collect();
        Ok(BuiltPath::Built { drv_path, outputs })
      }
    }
  }

  fn from_result(&self, path: &DerivedPath, result: &BuildResult) -> Result<BuiltPath, StoreError> {
    match path {
      DerivedPath::Opaque(p) => Ok(BuiltPath::Opaque(p.clone())),
      DerivedPath::Built { drv_path, outputs } => Ok(BuiltPath::Built {
        drv_path: self.drv_path(drv_path)?,
        outputs: result
          .built_outputs
          .iter()
          .filter(|(name, _)| outputs.contains(name))
          .map(|(name, realisation)| (name.clone(), realisation.out_path.clone()))
          .collect(),
      }),
    }
  }

  fn drv_path(&self, path: &SingleDerivedPath) -> Result<SingleBuiltPath, StoreError> {
    if let Some(built) = self.drv_paths.borrow().get(path) {
      return Ok(built.clone());
    }
    let built = match path {
      SingleDerivedPath::Opaque(p) => SingleBuiltPath::Opaque(p.clone()),
      SingleDerivedPath::Built { drv_path, output } => {
        let inner = self.drv_path(drv_path)?;
        let out_path = self
          .output_map(inner.out_path())?
          .remove(output)
          .ok_or_else(|| StoreError::MissingOutput {
            drv: self.store.store_dir().print_path(inner.out_path()),
            output: output.clone(),
          })?;
        if !self.store.is_valid_path(&out_path) {
          return Err(StoreError::NotRealized {
            drv: self.store.store_dir().print_path(inner.out_path()),
            output: output.clone(),
          });
        }
        SingleBuiltPath::Built {
          drv_path: Box::new(inner),
          output: (output.clone(), out_path),
        }
      }
    };
    self.drv_paths.borrow_mut().insert(path.clone(), built.clone());
    Ok(built)
  }

  /// Output paths of a derivation, read from the eval store when the build
  /// store has not seen it.
  fn output_map(&self, drv_path: &StorePath) -> Result<BTreeMap<OutputName, StorePath>, StoreError> {
    match self.store.query_derivation_output_map(drv_path) {
      Err(StoreError::UnknownDerivation(_)) => self.eval_store.query_derivation_output_map(drv_path),
      other => other,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use super::*;
  use crate::derived::{ExtendedOutputsSpec, OutputsSpec};
  use crate::installable::{InstallableDerivedPath, InstallableParser};
  use crate::util::testutil::{TestStore, eval_state, flake_fixture, test_derivation};

  const HASH: &str = "0123456789abcdef0123456789abcdef";

  const FLAKE: &str = r#"
return {
  outputs = function()
    local hello = derivation { name = "hello", builder = "echo hi > $out" }
    local multi = derivation { name = "multi", builder = "true", outputs = { "out", "dev" } }
    local broken = derivation { name = "broken", builder = "false" }
    return {
      packages = { ["x86_64-linux"] = { default = hello, hello = hello, multi = multi, broken = broken } },
    }
  end,
}
"#;

  fn literal(store: &TestStore, s: &str, outputs: ExtendedOutputsSpec) -> Installable {
    Installable::DerivedPath(InstallableDerivedPath::parse(store.store_dir(), s, outputs).unwrap())
  }

  mod outputs {
    use super::*;

    #[test]
    fn default_package_builds_its_out_output() {
      let fixture = flake_fixture();
      fixture.write("hello", FLAKE);
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());
      let installables = InstallableParser::new(&state, fixture.root())
        .parse(&["./hello"])
        .unwrap();

      let results = build(&state, store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
      assert_eq!(results.len(), 1);
      let BuiltPath::Built { outputs, .. } = &results[0].path else {
        panic!("expected a built path");
      };
      assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["out"]);
      assert!(store.is_valid_path(&outputs["out"]));
      assert_eq!(results[0].result.as_ref().map(|r| r.status), Some(BuildStatus::Built));
    }

    #[test]
    fn identical_paths_are_built_once() {
      let fixture = flake_fixture();
      fixture.write("hello", FLAKE);
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());
      let installables = InstallableParser::new(&state, fixture.root())
        .parse(&["./hello", "./hello#hello"])
        .unwrap();

      let results =
        build_with_installables(&state, store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
      assert_eq!(store.build_calls(), 1);
      assert_eq!(store.requests()[0].len(), 1);
      assert_eq!(results.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
      assert_eq!(results[0].1.path, results[1].1.path);
      assert_ne!(results[0].1.info.attr_path, results[1].1.info.attr_path);
    }

    #[test]
    fn store_paths_need_no_build() {
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());
      let path = StorePath::from_base_name(&format!("{HASH}-foo")).unwrap();
      store.add_valid(&path);
      let installables = [literal(&store, &format!("/store/{HASH}-foo"), ExtendedOutputsSpec::Default)];

      let results = build(&state, store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
      assert_eq!(results[0].path, BuiltPath::Opaque(path));
      assert_eq!(store.build_calls(), 0);
    }

    #[test]
    fn first_failure_fails_the_call() {
      let fixture = flake_fixture();
      fixture.write("hello", FLAKE);
      let store = Rc::new(TestStore::new());
      store.fail_builds_of("broken");
      let state = eval_state(store.clone());
      let installables = InstallableParser::new(&state, fixture.root())
        .parse(&["./hello#hello", "./hello#broken"])
        .unwrap();

      let err = build(&state, store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap_err();
      assert!(matches!(
        err,
        InstallableError::Store(StoreError::BuildFailed {
          status: BuildStatus::PermanentFailure,
          ..
        })
      ));
      assert_eq!(store.build_calls(), 1);
    }

    #[test]
    fn dynamic_derivations_build_their_generator_first() {
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());
      let generator = store.write_derivation(&test_derivation("gen", "true"), false).unwrap();
      store.generate("gen", test_derivation("inner", "true"));

      let s = format!("{}^out", store.store_dir().print_path(&generator));
      let installables = [literal(
        &store,
        &s,
        ExtendedOutputsSpec::Explicit(OutputsSpec::names(["out"])),
      )];
      let results = build(&state, store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
      let BuiltPath::Built { drv_path, outputs } = &results[0].path else {
        panic!("expected a built path");
      };
      assert!(matches!(drv_path, SingleBuiltPath::Built { output, .. } if output.0 == "out"));
      assert_eq!(outputs.len(), 1);
    }
  }

  mod without_building {
    use super::*;

    #[test]
    fn nothing_mode_writes_nothing() {
      let fixture = flake_fixture();
      fixture.write("hello", FLAKE);
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());
      let installables = InstallableParser::new(&state, fixture.root())
        .parse(&["./hello#multi^*"])
        .unwrap();

      let results = build(&state, store.as_ref(), Realise::Nothing, &installables, BuildMode::Normal).unwrap();
      let BuiltPath::Built { outputs, .. } = &results[0].path else {
        panic!("expected a built path");
      };
      assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["dev", "out"]);
      assert!(results[0].result.is_none());
      assert_eq!(store.derivation_count(), 0);
      assert_eq!(store.build_calls(), 0);
    }

    #[test]
    fn derivation_mode_writes_derivations() {
      let fixture = flake_fixture();
      fixture.write("hello", FLAKE);
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());
      let installables = InstallableParser::new(&state, fixture.root())
        .parse(&["./hello#hello"])
        .unwrap();

      let results = build(&state, store.as_ref(), Realise::Derivation, &installables, BuildMode::Normal).unwrap();
      assert_eq!(store.derivation_count(), 1);
      assert_eq!(store.build_calls(), 0);
      assert!(!store.is_valid_path(results[0].path.out_paths().first().unwrap()));
    }

    #[test]
    fn dynamic_outputs_are_unreadable_before_building() {
      let store = Rc::new(TestStore::new());
      let state = eval_state(store.clone());
      let generator = store.write_derivation(&test_derivation("gen", "true"), false).unwrap();
      let s = format!("{}^out", store.store_dir().print_path(&generator));
      let installables = [literal(
        &store,
        &s,
        ExtendedOutputsSpec::Explicit(OutputsSpec::names(["out"])),
      )];

      let err = build(&state, store.as_ref(), Realise::Nothing, &installables, BuildMode::Normal).unwrap_err();
      assert!(matches!(err, InstallableError::Store(StoreError::NotRealized { .. })));
    }
  }
}
