//! Test utilities for realize-lib.
//!
//! [`TestStore`] is an in-memory store whose "builds" only mark outputs
//! valid, and which records every batch it is asked to build. Flake
//! fixtures create throwaway flakes on disk.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tempfile::TempDir;

use crate::derived::{DerivedPath, OutputsSpec, SingleDerivedPath};
use crate::eval::{EvalCacheDb, EvalSettings, EvalState, MemoryEvalCacheDb};
use crate::flake::{FlakeLocker, FlakeRef, Registries, Registry};
use crate::store::{
  BuildMode, BuildResult, BuildStatus, Derivation, KeyedBuildResult, Realisation, Store, StoreDir, StoreError, StorePath,
  output_path_of,
};

pub struct TestStore {
  store_dir: StoreDir,
  derivations: RefCell<BTreeMap<StorePath, Derivation>>,
  pending: RefCell<BTreeMap<StorePath, Derivation>>,
  valid: RefCell<BTreeSet<StorePath>>,
  derivers: RefCell<BTreeMap<StorePath, Vec<StorePath>>>,
  failing: RefCell<BTreeSet<String>>,
  generated: RefCell<BTreeMap<String, Derivation>>,
  requests: RefCell<Vec<Vec<DerivedPath>>>,
}

impl Default for TestStore {
  fn default() -> Self {
    Self::new()
  }
}

impl TestStore {
  pub fn new() -> Self {
    Self {
      store_dir: StoreDir::new("/store"),
      derivations: RefCell::default(),
      pending: RefCell::default(),
      valid: RefCell::default(),
      derivers: RefCell::default(),
      failing: RefCell::default(),
      generated: RefCell::default(),
      requests: RefCell::default(),
    }
  }

  /// Number of derivations written with `read_only = false`.
  pub fn derivation_count(&self) -> usize {
    self.derivations.borrow().len()
  }

  pub fn add_valid(&self, path: &StorePath) {
    self.valid.borrow_mut().insert(path.clone());
  }

  pub fn add_deriver(&self, path: &StorePath, drv_path: &StorePath) {
    self.derivers.borrow_mut().entry(path.clone()).or_default().push(drv_path.clone());
  }

  /// Builds of derivations named `name` fail.
  pub fn fail_builds_of(&self, name: &str) {
    self.failing.borrow_mut().insert(name.to_string());
  }

  /// Building a derivation named `name` produces `drv` at each output.
  pub fn generate(&self, name: &str, drv: Derivation) {
    self.generated.borrow_mut().insert(name.to_string(), drv);
  }

  /// Number of `build_paths_with_results` calls.
  pub fn build_calls(&self) -> usize {
    self.requests.borrow().len()
  }

  pub fn requests(&self) -> Vec<Vec<DerivedPath>> {
    self.requests.borrow().clone()
  }

  fn read(&self, drv_path: &StorePath, eval_store: &dyn Store) -> Result<Derivation, StoreError> {
    match self.read_derivation(drv_path) {
      Ok(drv) => Ok(drv),
      Err(_) => eval_store.read_derivation(drv_path),
    }
  }

  fn realize_drv_path(&self, drv_path: &SingleDerivedPath, eval_store: &dyn Store) -> Result<StorePath, BuildResult> {
    match drv_path {
      SingleDerivedPath::Opaque(path) => Ok(path.clone()),
      SingleDerivedPath::Built { drv_path: inner, output } => {
        let inner = self.realize_drv_path(inner, eval_store)?;
        let result = self.build_drv(&inner, &OutputsSpec::names([output.clone()]), eval_store);
        if !result.success() {
          return Err(BuildResult::failure(BuildStatus::DependencyFailed, result.error_msg));
        }
        output_path_of(self, &inner, output).map_err(|e| BuildResult::failure(BuildStatus::MiscFailure, e.to_string()))
      }
    }
  }

  fn build_drv(&self, drv_path: &StorePath, outputs: &OutputsSpec, eval_store: &dyn Store) -> BuildResult {
    let drv = match self.read(drv_path, eval_store) {
      Ok(drv) => drv,
      Err(e) => return BuildResult::failure(BuildStatus::MiscFailure, e.to_string()),
    };
    if self.failing.borrow().contains(&drv.name) {
      return BuildResult::failure(BuildStatus::PermanentFailure, format!("builder for '{}' failed", drv.name));
    }
    for (input, input_outputs) in &drv.input_drvs {
      let built = self
        .realize_drv_path(input, eval_store)
        .map(|input| self.build_drv(&input, &OutputsSpec::Names(input_outputs.clone()), eval_store));
      match built {
        Ok(result) if result.success() => {}
        Ok(result) | Err(result) => return BuildResult::failure(BuildStatus::DependencyFailed, result.error_msg),
      }
    }

    let output_paths = match drv.output_paths(drv_path) {
      Ok(paths) => paths,
      Err(e) => return BuildResult::failure(BuildStatus::MiscFailure, e.to_string()),
    };
    let mut result = BuildResult::new(BuildStatus::AlreadyValid);
    for (name, out_path) in output_paths {
      if !outputs.contains(&name) {
        continue;
      }
      if !self.is_valid_path(&out_path) {
        result.status = BuildStatus::Built;
        result.times_built = 1;
        self.add_valid(&out_path);
        self.add_deriver(&out_path, drv_path);
        if let Some(generated) = self.generated.borrow().get(&drv.name) {
          self.derivations.borrow_mut().insert(out_path.clone(), generated.clone());
        }
      }
      result.built_outputs.insert(
        name.clone(),
        Realisation {
          drv_path: drv_path.clone(),
          output: name,
          out_path,
        },
      );
    }
    result
  }
}

impl Store for TestStore {
  fn store_dir(&self) -> &StoreDir {
    &self.store_dir
  }

  fn is_valid_path(&self, path: &StorePath) -> bool {
    self.valid.borrow().contains(path) || self.derivations.borrow().contains_key(path)
  }

  fn is_known_derivation(&self, drv_path: &StorePath) -> bool {
    self.derivations.borrow().contains_key(drv_path) || self.pending.borrow().contains_key(drv_path)
  }

  fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError> {
    self
      .derivations
      .borrow()
      .get(drv_path)
      .or(self.pending.borrow().get(drv_path))
      .cloned()
      .ok_or_else(|| StoreError::UnknownDerivation(self.store_dir.print_path(drv_path)))
  }

  fn write_derivation(&self, drv: &Derivation, read_only: bool) -> Result<StorePath, StoreError> {
    drv.validate()?;
    let path = drv.path()?;
    if read_only {
      self.pending.borrow_mut().insert(path.clone(), drv.clone());
    } else {
      self.pending.borrow_mut().remove(&path);
      self.derivations.borrow_mut().insert(path.clone(), drv.clone());
    }
    Ok(path)
  }

  fn query_valid_derivers(&self, path: &StorePath) -> Result<Vec<StorePath>, StoreError> {
    Ok(self.derivers.borrow().get(path).cloned().unwrap_or_default())
  }

  fn build_paths_with_results(
    &self,
    paths: &[DerivedPath],
    _mode: BuildMode,
    eval_store: &dyn Store,
  ) -> Result<Vec<KeyedBuildResult>, StoreError> {
    self.requests.borrow_mut().push(paths.to_vec());
    Ok(
      paths
        .iter()
        .map(|path| {
          let result = match path {
            DerivedPath::Opaque(p) if self.is_valid_path(p) => BuildResult::new(BuildStatus::AlreadyValid),
            DerivedPath::Opaque(p) => BuildResult::failure(BuildStatus::MiscFailure, format!("path '{p}' is not valid")),
            DerivedPath::Built { drv_path, outputs } => match self.realize_drv_path(drv_path, eval_store) {
              Ok(drv) => self.build_drv(&drv, outputs, eval_store),
              Err(failure) => failure,
            },
          };
          KeyedBuildResult {
            path: path.clone(),
            result,
          }
        })
        .collect(),
    )
  }
}

/// A directory of throwaway flakes.
pub struct FlakeFixture {
  _temp: TempDir,
  root: PathBuf,
}

impl FlakeFixture {
  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Write `<root>/<name>/flake.lua` and return the flake directory.
  pub fn write(&self, name: &str, body: &str) -> PathBuf {
    let dir = self.root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("flake.lua"), body).unwrap();
    dir
  }

  pub fn flake_ref(&self, name: &str) -> FlakeRef {
    FlakeRef::path(self.root.join(name))
  }
}

pub fn flake_fixture() -> FlakeFixture {
  let temp = TempDir::new().unwrap();
  let root = dunce::canonicalize(temp.path()).unwrap();
  FlakeFixture { _temp: temp, root }
}

/// A locker with empty registries.
pub fn locker() -> FlakeLocker {
  FlakeLocker::new(
    Registries::new(Registry::default()),
    std::env::temp_dir().join("realize-test-cache"),
  )
}

/// An evaluator for `x86_64-linux` over `store`, caching into memory.
pub fn eval_state(store: Rc<TestStore>) -> EvalState {
  let settings = EvalSettings {
    system: "x86_64-linux".to_string(),
    cache_dir: std::env::temp_dir(),
    ..EvalSettings::default()
  };
  let db = Rc::new(MemoryEvalCacheDb::new());
  EvalState::new(store, Rc::new(locker()), settings)
    .unwrap()
    .with_cache_db(Box::new(move |_: &str| -> Rc<dyn EvalCacheDb> { db.clone() }))
}

/// A derivation with the given name and builder and an `out` output.
pub fn test_derivation(name: &str, builder: &str) -> Derivation {
  Derivation {
    name: name.to_string(),
    system: "x86_64-linux".to_string(),
    builder: builder.to_string(),
    outputs: BTreeSet::from(["out".to_string()]),
    env: BTreeMap::new(),
    input_drvs: BTreeMap::new(),
    input_srcs: BTreeSet::new(),
  }
}
