//! Evaluation of flakes, files and expressions.
//!
//! [`EvalState`] owns the Lua runtime and everything evaluation shares
//! across installables: the flake locker, one [`EvalCache`] per locked
//! flake, and the derivations instantiated so far. Derivations live in
//! memory until something asks for them to be written to the store with
//! [`EvalState::write_derivation_closure`].

pub mod attr_path;
pub mod cache;
pub mod cache_db;
mod flake;
pub mod runtime;
pub mod suggestions;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

pub use attr_path::{parse_attr_path, show_attr_path};
pub use cache::{AttrCursor, EvalCache};
pub use cache_db::{CachedValue, EvalCacheDb, FileEvalCacheDb, MemoryEvalCacheDb};
pub use runtime::Instantiated;
pub use suggestions::{OrSuggestions, Suggestions};

use self::flake::FlakeEvaluator;
use crate::consts::{ALLOW_EVAL_ENV, EVAL_CACHE_DIR};
use crate::derived::SingleDerivedPath;
use crate::flake::{FlakeError, FlakeLocker, LockedFlake};
use crate::placeholder;
use crate::platform;
use crate::store::{Store, StoreDir, StoreError, StorePath};

#[derive(Debug, Error)]
pub enum EvalError {
  #[error("{0}")]
  Lua(#[from] LuaError),

  #[error(transparent)]
  Flake(#[from] FlakeError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("attribute '{attr}' missing{}{}", at_path(.path), with_suggestions(.suggestions))]
  AttrMissing {
    attr: String,
    path: String,
    suggestions: Suggestions,
  },

  #[error("expected {expected} but found {actual} at '{path}'")]
  TypeError {
    path: String,
    expected: &'static str,
    actual: String,
  },

  #[error("cached attribute '{0}' needs evaluation, which is disabled by {ALLOW_EVAL_ENV}=0")]
  CacheMiss(String),

  #[error("cached failure of attribute '{0}'")]
  CachedFailure(String),

  #[error("invalid attribute path: {0}")]
  BadAttrPath(String),

  #[error("I/O error on '{path}': {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

fn at_path(path: &str) -> String {
  if path.is_empty() { String::new() } else { format!(" at '{path}'") }
}

fn with_suggestions(suggestions: &Suggestions) -> String {
  if suggestions.is_empty() { String::new() } else { format!("\n\n{suggestions}") }
}

/// How evaluation behaves, built from flags and the environment.
#[derive(Debug, Clone)]
pub struct EvalSettings {
  /// Value of `builtins.currentSystem`.
  pub system: String,
  pub use_eval_cache: bool,
  /// Flake files cannot see `builtins.currentSystem`.
  pub pure_eval: bool,
  /// When false, a cached evaluation that misses fails instead of
  /// evaluating.
  pub allow_eval: bool,
  pub cache_dir: PathBuf,
}

impl Default for EvalSettings {
  fn default() -> Self {
    Self {
      system: platform::current_system(),
      use_eval_cache: true,
      pure_eval: true,
      allow_eval: true,
      cache_dir: platform::paths::cache_dir(),
    }
  }
}

impl EvalSettings {
  pub fn from_env() -> Self {
    let allow_eval = std::env::var(ALLOW_EVAL_ENV).map(|v| v != "0").unwrap_or(true);
    Self {
      allow_eval,
      ..Self::default()
    }
  }
}

/// Per-call evaluation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalMode {
  /// Compute derivation paths without registering anything in the store.
  pub read_only: bool,
}

/// An argument passed to a file or expression that evaluates to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoArg {
  /// A Lua expression.
  Expr(String),
  String(String),
}

pub type AutoArgs = BTreeMap<String, AutoArg>;

/// Opens the cache database of a flake fingerprint.
pub type CacheDbOpener = Box<dyn Fn(&str) -> Rc<dyn EvalCacheDb>>;

pub struct EvalState {
  lua: Lua,
  store: Rc<dyn Store>,
  settings: EvalSettings,
  flakes: FlakeEvaluator,
  open_db: CacheDbOpener,
  caches: RefCell<HashMap<String, Rc<EvalCache>>>,
  instantiated: Rc<RefCell<Instantiated>>,
}

impl EvalState {
  pub fn new(store: Rc<dyn Store>, locker: Rc<FlakeLocker>, settings: EvalSettings) -> Result<Self, EvalError> {
    let instantiated = Rc::new(RefCell::new(Instantiated::default()));
    let lua = runtime::create_runtime(&settings.system, store.store_dir(), Rc::clone(&instantiated))?;
    let flake_env = if settings.pure_eval {
      Some(pure_environment(&lua)?)
    } else {
      None
    };
    let db_dir = settings.cache_dir.join(EVAL_CACHE_DIR);
    Ok(Self {
      flakes: FlakeEvaluator::new(lua.clone(), locker, flake_env),
      lua,
      store,
      settings,
      open_db: Box::new(move |fingerprint: &str| -> Rc<dyn EvalCacheDb> {
        Rc::new(FileEvalCacheDb::open(&db_dir, fingerprint))
      }),
      caches: RefCell::new(HashMap::new()),
      instantiated,
    })
  }

  /// Replace where cache databases come from.
  pub fn with_cache_db(mut self, open_db: CacheDbOpener) -> Self {
    self.open_db = open_db;
    self
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  pub fn store(&self) -> &Rc<dyn Store> {
    &self.store
  }

  pub fn store_dir(&self) -> &StoreDir {
    self.store.store_dir()
  }

  pub fn settings(&self) -> &EvalSettings {
    &self.settings
  }

  pub fn locker(&self) -> &Rc<FlakeLocker> {
    &self.flakes.locker
  }

  /// The eval cache over `outputs` of a locked flake. Cached on disk only
  /// for pure evaluation of a fully locked flake.
  pub fn open_eval_cache(&self, locked: &Rc<LockedFlake>) -> Rc<EvalCache> {
    let fingerprint = locked.fingerprint();
    let use_db = self.settings.use_eval_cache && self.settings.pure_eval && fingerprint.is_some();
    let key = match (&fingerprint, use_db) {
      (Some(fp), true) => fp.clone(),
      _ => format!("uncached:{}", locked.flake.locked_ref),
    };
    if let Some(cache) = self.caches.borrow().get(&key) {
      return Rc::clone(cache);
    }

    let db = use_db.then(|| (self.open_db)(&key));
    debug!(flake = %locked.flake.locked_ref, cached = db.is_some(), "opening eval cache");
    let flakes = self.flakes.clone();
    let locked = Rc::clone(locked);
    let cache = EvalCache::new(
      self.lua.clone(),
      db,
      self.settings.allow_eval,
      Box::new(move || flakes.outputs(&locked)),
    );
    self.caches.borrow_mut().insert(key, Rc::clone(&cache));
    cache
  }

  /// Evaluate a file, or standard input for `-`, calling the result with
  /// `auto_args` if it is a function.
  pub fn eval_file(&self, path: &Path, auto_args: &AutoArgs) -> Result<LuaValue, EvalError> {
    let value = if path == Path::new("-") {
      let mut source = String::new();
      std::io::stdin()
        .read_to_string(&mut source)
        .map_err(|source| EvalError::Io {
          path: "<stdin>".to_string(),
          source,
        })?;
      self.lua.load(&source).set_name("=<stdin>").eval()?
    } else {
      runtime::load_file_with_dir(&self.lua, path, None)?
    };
    self.auto_call(value, auto_args)
  }

  pub fn eval_expr(&self, expr: &str, auto_args: &AutoArgs) -> Result<LuaValue, EvalError> {
    let value = runtime::eval_string(&self.lua, expr, "=<expr>", &[])?;
    self.auto_call(value, auto_args)
  }

  /// Call a file's function with `packages` merged with `auto_args`.
  pub fn call_package(&self, path: &Path, packages: LuaValue, auto_args: &AutoArgs) -> Result<LuaValue, EvalError> {
    let function = match runtime::load_file_with_dir(&self.lua, path, None)? {
      LuaValue::Function(f) => f,
      other => {
        return Err(EvalError::TypeError {
          path: path.display().to_string(),
          expected: "a function",
          actual: other.type_name().to_string(),
        });
      }
    };
    let args = self.lua.create_table()?;
    if let LuaValue::Table(packages) = packages {
      for pair in packages.pairs::<LuaValue, LuaValue>() {
        let (k, v) = pair?;
        args.set(k, v)?;
      }
    }
    self.set_auto_args(&args, auto_args)?;
    Ok(function.call(args)?)
  }

  fn auto_call(&self, value: LuaValue, auto_args: &AutoArgs) -> Result<LuaValue, EvalError> {
    match value {
      LuaValue::Function(f) => {
        let args = self.lua.create_table()?;
        self.set_auto_args(&args, auto_args)?;
        Ok(f.call(args)?)
      }
      other => Ok(other),
    }
  }

  fn set_auto_args(&self, args: &LuaTable, auto_args: &AutoArgs) -> Result<(), EvalError> {
    for (name, arg) in auto_args {
      let value = match arg {
        AutoArg::Expr(expr) => runtime::eval_string(&self.lua, expr, &format!("=--arg {name}"), &[])?,
        AutoArg::String(s) => LuaValue::String(self.lua.create_string(s)?),
      };
      args.set(name.as_str(), value)?;
    }
    Ok(())
  }

  /// Evaluate `expr` with `scope` variables visible.
  pub fn eval_in_scope(&self, expr: &str, name: &str, scope: &[(&str, LuaValue)]) -> Result<LuaValue, EvalError> {
    Ok(runtime::eval_string(&self.lua, expr, name, scope)?)
  }

  /// The derivation a derivation-valued cursor denotes.
  ///
  /// A cached `drvPath` may name a derivation neither the store nor this
  /// evaluator knows about (the cache outlived the store, or it was never
  /// written); the attribute is then evaluated again to regenerate it.
  pub fn force_derivation(&self, cursor: &AttrCursor) -> Result<SingleDerivedPath, EvalError> {
    let drv_path_cursor = cursor.get_attr("drvPath")?;
    let drv_path = self.parse_drv_path(&drv_path_cursor.get_string()?)?;
    if self.is_known(drv_path.base_store_path()) {
      return Ok(drv_path);
    }
    debug!(attr = %cursor.attr_path_string(), "derivation not found, re-evaluating drvPath");
    let regenerated = self.parse_drv_path(&drv_path_cursor.get_string_live()?)?;
    if !self.is_known(regenerated.base_store_path()) {
      return Err(StoreError::UnknownDerivation(self.store_dir().print_path(regenerated.base_store_path())).into());
    }
    Ok(regenerated)
  }

  fn parse_drv_path(&self, s: &str) -> Result<SingleDerivedPath, EvalError> {
    match placeholder::as_sole_placeholder(s) {
      Some(path) => Ok(path),
      None => Ok(SingleDerivedPath::Opaque(
        self.store_dir().parse_path(s).map_err(StoreError::from)?,
      )),
    }
  }

  fn is_known(&self, drv_path: &StorePath) -> bool {
    self.instantiated.borrow().derivations.contains_key(drv_path) || self.store.is_known_derivation(drv_path)
  }

  /// Write an instantiated derivation and everything it depends on to the
  /// store. Paths the store already knows are left alone.
  pub fn write_derivation_closure(&self, drv_path: &SingleDerivedPath, mode: EvalMode) -> Result<(), EvalError> {
    let mut done = BTreeSet::new();
    self.write_closure(drv_path.base_store_path(), mode, &mut done)
  }

  fn write_closure(&self, drv_path: &StorePath, mode: EvalMode, done: &mut BTreeSet<StorePath>) -> Result<(), EvalError> {
    if !done.insert(drv_path.clone()) {
      return Ok(());
    }
    let drv = self.instantiated.borrow().derivations.get(drv_path).cloned();
    let Some(drv) = drv else {
      if self.store.is_known_derivation(drv_path) {
        return Ok(());
      }
      return Err(StoreError::UnknownDerivation(self.store_dir().print_path(drv_path)).into());
    };
    for input in drv.input_drvs.keys() {
      self.write_closure(input.base_store_path(), mode, done)?;
    }
    if !self.store.is_known_derivation(drv_path) || !mode.read_only {
      let written = self.store.write_derivation(&drv, mode.read_only)?;
      info!(drv = %written, read_only = mode.read_only, "wrote derivation");
    }
    Ok(())
  }
}

/// Globals for flake files: `builtins` without `currentSystem`.
fn pure_environment(lua: &Lua) -> LuaResult<LuaTable> {
  let builtins = lua.create_table()?;
  for pair in lua.globals().get::<LuaTable>("builtins")?.pairs::<LuaValue, LuaValue>() {
    let (k, v) = pair?;
    builtins.set(k, v)?;
  }
  builtins.set("currentSystem", LuaValue::Nil)?;

  let env = lua.create_table()?;
  env.set("builtins", builtins)?;
  let mt = lua.create_table()?;
  mt.set("__index", lua.globals())?;
  env.set_metatable(Some(mt))?;
  Ok(env)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  use crate::util::testutil::{TestStore, eval_state as state, flake_fixture};

  mod settings {
    use super::*;

    #[test]
    #[serial]
    fn allow_eval_from_env() {
      temp_env::with_var(ALLOW_EVAL_ENV, Some("0"), || {
        assert!(!EvalSettings::from_env().allow_eval);
      });
      temp_env::with_var(ALLOW_EVAL_ENV, None::<&str>, || {
        assert!(EvalSettings::from_env().allow_eval);
      });
    }
  }

  mod files {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_functions_get_auto_args() {
      let temp = TempDir::new().unwrap();
      let file = temp.path().join("default.lua");
      std::fs::write(&file, "return function(args) return { greeting = args.greeting, n = args.n } end").unwrap();

      let state = state(Rc::new(TestStore::new()));
      let args = AutoArgs::from([
        ("greeting".to_string(), AutoArg::String("hi".to_string())),
        ("n".to_string(), AutoArg::Expr("1 + 1".to_string())),
      ]);
      let LuaValue::Table(value) = state.eval_file(&file, &args).unwrap() else {
        panic!("expected a table");
      };
      assert_eq!(value.get::<String>("greeting").unwrap(), "hi");
      assert_eq!(value.get::<i64>("n").unwrap(), 2);
    }

    #[test]
    fn expressions_may_be_blocks() {
      let state = state(Rc::new(TestStore::new()));
      let value = state.eval_expr("local x = 20 return x + 1", &AutoArgs::new()).unwrap();
      assert_eq!(value.as_i64(), Some(21));
    }
  }

  mod derivations {
    use super::*;

    #[test]
    fn closure_is_written_inputs_first() {
      let store = Rc::new(TestStore::new());
      let state = state(store.clone());
      let value = state
        .eval_expr(
          r#"(function()
            local dep = derivation { name = "dep", builder = "echo > $out" }
            return derivation { name = "top", builder = "cat " .. dep .. " > $out" }
          end)()"#,
          &AutoArgs::new(),
        )
        .unwrap();
      let cache = EvalCache::from_value(state.lua().clone(), value);
      let drv_path = state.force_derivation(&cache.root_cursor()).unwrap();

      state.write_derivation_closure(&drv_path, EvalMode::default()).unwrap();
      assert_eq!(store.derivation_count(), 2);
      assert!(store.is_known_derivation(drv_path.base_store_path()));
    }

    #[test]
    fn read_only_writes_do_not_register() {
      let store = Rc::new(TestStore::new());
      let state = state(store.clone());
      let value = state
        .eval_expr(r#"derivation { name = "x", builder = "true" }"#, &AutoArgs::new())
        .unwrap();
      let cache = EvalCache::from_value(state.lua().clone(), value);
      let drv_path = state.force_derivation(&cache.root_cursor()).unwrap();
      state
        .write_derivation_closure(&drv_path, EvalMode { read_only: true })
        .unwrap();
      assert!(!store.is_valid_path(drv_path.base_store_path()));
    }
  }

  mod flakes {
    use super::*;

    #[test]
    fn outputs_see_inputs_and_self() {
      let fixture = flake_fixture();
      fixture.write(
        "dep",
        r#"return { outputs = function(inputs) return { value = "from dep" } end }"#,
      );
      fixture.write(
        "top",
        r#"
        return {
          inputs = { dep = "path:../dep" },
          outputs = function(inputs)
            return {
              dep_value = inputs.dep.value,
              self_path = inputs.self.outPath,
              echoed = builtins.lazy(function() return inputs.self.dep_value end),
            }
          end,
        }
        "#,
      );
      let state = state(Rc::new(TestStore::new()));
      let locked = state
        .locker()
        .lock(&fixture.flake_ref("top"), &Default::default())
        .unwrap();
      let root = state.open_eval_cache(&locked).root_cursor();
      assert_eq!(root.get_attr("dep_value").unwrap().get_string().unwrap(), "from dep");
      assert_eq!(root.get_attr("echoed").unwrap().get_string().unwrap(), "from dep");
      assert!(root.get_attr("self_path").unwrap().get_string().unwrap().ends_with("top"));
    }

    #[test]
    fn non_flake_inputs_are_plain_sources() {
      let fixture = flake_fixture();
      fixture.write("dep", r#"return { outputs = function() return { value = "unused" } end }"#);
      fixture.write(
        "top",
        r#"
        return {
          inputs = { src = { url = "path:../dep", flake = false } },
          outputs = function(inputs)
            return {
              src_path = inputs.src.outPath,
              has_value = tostring(inputs.src.value ~= nil),
            }
          end,
        }
        "#,
      );
      let state = state(Rc::new(TestStore::new()));
      let locked = state
        .locker()
        .lock(&fixture.flake_ref("top"), &Default::default())
        .unwrap();
      let root = state.open_eval_cache(&locked).root_cursor();
      assert!(root.get_attr("src_path").unwrap().get_string().unwrap().ends_with("dep"));
      assert_eq!(root.get_attr("has_value").unwrap().get_string().unwrap(), "false");
    }

    #[test]
    fn pure_flakes_cannot_see_current_system() {
      let fixture = flake_fixture();
      fixture.write(
        "top",
        r#"return { outputs = function() return { system = builtins.currentSystem or "none" } end }"#,
      );
      let state = state(Rc::new(TestStore::new()));
      let locked = state
        .locker()
        .lock(&fixture.flake_ref("top"), &Default::default())
        .unwrap();
      let root = state.open_eval_cache(&locked).root_cursor();
      assert_eq!(root.get_attr("system").unwrap().get_string().unwrap(), "none");
    }

    #[test]
    fn eval_caches_are_shared_per_fingerprint() {
      let fixture = flake_fixture();
      fixture.write("top", r#"return { outputs = function() return {} end }"#);
      let state = state(Rc::new(TestStore::new()));
      let locked = state
        .locker()
        .lock(&fixture.flake_ref("top"), &Default::default())
        .unwrap();
      let a = state.open_eval_cache(&locked);
      let b = state.open_eval_cache(&locked);
      assert!(Rc::ptr_eq(&a, &b));
      assert!(a.is_cached());
    }
  }
}
