//! The Lua runtime: globals, derivation instantiation and file loading.
//!
//! Globals registered here:
//! - `derivation{}` - instantiate a derivation (defined in the prelude on top
//!   of the native `instantiate` hook)
//! - `builtins` - `currentSystem`, `storeDir`, `lazy`, `force`,
//!   `outputOf`, `mkDerivation`, `makeOverridable`, `isDerivation`
//! - `dofile` - resolves relative paths against the calling file's `__dir`
//!
//! Files are loaded with an environment table holding `__dir`, falling back
//! to a base table (normally `_G`) for everything else.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::debug;

use crate::consts::LAZY_KEY;
use crate::derived::{OutputName, SingleDerivedPath};
use crate::placeholder;
use crate::store::{Derivation, StoreDir, StorePath};

const PRELUDE: &str = include_str!("prelude.lua");

/// Registry key for the `__dir` of the file currently being loaded.
const CURRENT_DIR_KEY: &str = "__realize_current_dir";

/// Attributes of `derivation{}` that do not become builder environment.
const RESERVED_ATTRS: &[&str] = &["name", "builder", "system", "outputs", "env", "meta", "passthru"];

/// Derivations instantiated by this evaluator, plus an index from printed
/// output paths back to the derivation producing them.
#[derive(Debug, Default)]
pub struct Instantiated {
  pub derivations: HashMap<StorePath, Derivation>,
  outputs: BTreeMap<String, (StorePath, OutputName)>,
}

impl Instantiated {
  fn register(&mut self, store_dir: &StoreDir, drv_path: StorePath, drv: Derivation, outputs: &BTreeMap<OutputName, StorePath>) {
    for (name, path) in outputs {
      self
        .outputs
        .insert(store_dir.print_path(path), (drv_path.clone(), name.clone()));
    }
    self.derivations.insert(drv_path, drv);
  }

  /// Record every reference to a known output or placeholder in `s`.
  fn scan(&self, s: &str, drv: &mut Derivation) -> LuaResult<()> {
    for (path, (drv_path, output)) in &self.outputs {
      if s.contains(path.as_str()) {
        drv
          .input_drvs
          .entry(SingleDerivedPath::Opaque(drv_path.clone()))
          .or_default()
          .insert(output.clone());
      }
    }
    for reference in placeholder::references(s).map_err(LuaError::external)? {
      match reference {
        SingleDerivedPath::Built { drv_path, output } => {
          drv.input_drvs.entry(*drv_path).or_default().insert(output);
        }
        SingleDerivedPath::Opaque(path) => {
          drv.input_srcs.insert(path);
        }
      }
    }
    Ok(())
  }
}

/// Create a Lua state with the runtime globals installed.
pub fn create_runtime(system: &str, store_dir: &StoreDir, instantiated: Rc<RefCell<Instantiated>>) -> LuaResult<Lua> {
  let lua = Lua::new();

  let builtins = lua.create_table()?;
  builtins.set("currentSystem", system)?;
  builtins.set("storeDir", store_dir.path().to_string_lossy().into_owned())?;
  lua.globals().set("builtins", builtins)?;

  let native = lua.create_table()?;
  native.set("LAZY_KEY", LAZY_KEY)?;
  native.set(
    "instantiate",
    create_instantiate(&lua, system.to_string(), store_dir.clone(), instantiated)?,
  )?;
  native.set("output_of", create_output_of(&lua, store_dir.clone())?)?;
  lua.globals().set("__realize", native)?;

  lua.globals().set("dofile", create_dofile(&lua)?)?;

  lua.load(PRELUDE).set_name("@prelude.lua").exec()?;
  Ok(lua)
}

fn create_instantiate(
  lua: &Lua,
  system: String,
  store_dir: StoreDir,
  instantiated: Rc<RefCell<Instantiated>>,
) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, attrs: LuaTable| {
    let drv = derivation_from_attrs(lua, &attrs, &system, &instantiated.borrow())?;
    drv.validate().map_err(LuaError::external)?;
    let drv_path = drv.path().map_err(LuaError::external)?;
    let outputs = drv.output_paths(&drv_path).map_err(LuaError::external)?;

    let result = lua.create_table()?;
    result.set("drvPath", store_dir.print_path(&drv_path))?;
    let output_table = lua.create_table()?;
    for (name, path) in &outputs {
      output_table.set(name.as_str(), store_dir.print_path(path))?;
    }
    result.set("outputs", output_table)?;

    debug!(drv = %drv_path, "instantiated derivation");
    instantiated.borrow_mut().register(&store_dir, drv_path, drv, &outputs);
    Ok(result)
  })
}

fn derivation_from_attrs(
  lua: &Lua,
  attrs: &LuaTable,
  current_system: &str,
  instantiated: &Instantiated,
) -> LuaResult<Derivation> {
  let name: String = attrs
    .get::<Option<String>>("name")?
    .ok_or_else(|| LuaError::external("derivation is missing required attribute 'name'"))?;
  let required = |key: &str| -> LuaResult<String> {
    let value: LuaValue = attrs.get(key)?;
    if value.is_nil() {
      return Err(LuaError::external(format!(
        "derivation '{name}' is missing required attribute '{key}'"
      )));
    }
    coerce_to_string(lua, value)
  };
  let builder = required("builder")?;
  let system = match attrs.get::<LuaValue>("system")? {
    LuaValue::Nil => current_system.to_string(),
    value => coerce_to_string(lua, value)?,
  };
  let outputs: BTreeSet<OutputName> = attrs
    .get::<Option<Vec<String>>>("outputs")?
    .unwrap_or_else(|| vec!["out".to_string()])
    .into_iter()
    .collect();

  let mut env = BTreeMap::new();
  if let Some(declared) = attrs.get::<Option<LuaTable>>("env")? {
    for pair in declared.pairs::<String, LuaValue>() {
      let (key, value) = pair?;
      env.insert(key, coerce_to_string(lua, value)?);
    }
  }
  for pair in attrs.pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair?;
    let LuaValue::String(key) = key else {
      continue;
    };
    let key = key.to_str()?.to_string();
    if RESERVED_ATTRS.contains(&key.as_str()) || value.is_nil() {
      continue;
    }
    if let LuaValue::Function(_) = value {
      return Err(LuaError::external(format!(
        "derivation '{name}': cannot pass a function as attribute '{key}'"
      )));
    }
    env.insert(key, coerce_to_string(lua, value)?);
  }

  let mut drv = Derivation {
    name,
    system,
    builder,
    outputs,
    env,
    input_drvs: BTreeMap::new(),
    input_srcs: BTreeSet::new(),
  };
  let strings: Vec<String> = std::iter::once(drv.builder.clone()).chain(drv.env.values().cloned()).collect();
  for s in &strings {
    instantiated.scan(s, &mut drv)?;
  }
  Ok(drv)
}

fn create_output_of(lua: &Lua, store_dir: StoreDir) -> LuaResult<LuaFunction> {
  lua.create_function(move |_, (drv_path, output): (String, String)| {
    let inner = match placeholder::as_sole_placeholder(&drv_path) {
      Some(path) => path,
      None => SingleDerivedPath::Opaque(store_dir.parse_path(&drv_path).map_err(LuaError::external)?),
    };
    if !inner.base_store_path().is_derivation() {
      return Err(LuaError::external(format!("'{drv_path}' is not a derivation path")));
    }
    Ok(placeholder::render_built(&SingleDerivedPath::built(inner, output)))
  })
}

/// Force a value created by `builtins.lazy`. Other values pass through.
pub fn force(lua: &Lua, value: LuaValue) -> LuaResult<LuaValue> {
  match &value {
    LuaValue::Table(t) if !t.raw_get::<LuaValue>(LAZY_KEY)?.is_nil() => {
      let force: LuaFunction = lua.globals().get::<LuaTable>("builtins")?.get("force")?;
      force.call(value)
    }
    _ => Ok(value),
  }
}

/// Coerce a value to a string the way derivation attributes are: numbers
/// print, `true` is `"1"`, `false` is empty, tables with `outPath` become
/// that path and lists are joined with spaces.
pub fn coerce_to_string(lua: &Lua, value: LuaValue) -> LuaResult<String> {
  match force(lua, value)? {
    LuaValue::String(s) => Ok(s.to_str()?.to_string()),
    LuaValue::Integer(i) => Ok(i.to_string()),
    LuaValue::Number(n) => Ok(n.to_string()),
    LuaValue::Boolean(b) => Ok(if b { "1" } else { "" }.to_string()),
    LuaValue::Table(t) => {
      let out_path: LuaValue = t.get("outPath")?;
      if !out_path.is_nil() {
        return coerce_to_string(lua, out_path);
      }
      if t.raw_len() > 0 {
        let items = t
          .sequence_values::<LuaValue>()
          .map(|item| coerce_to_string(lua, item?))
          .collect::<LuaResult<Vec<_>>>()?;
        return Ok(items.join(" "));
      }
      Err(LuaError::external("cannot coerce a table to a string"))
    }
    other => Err(LuaError::external(format!("cannot coerce {} to a string", other.type_name()))),
  }
}

/// Load and run a Lua file with `__dir` set to its directory. Globals are
/// looked up in `base`, or `_G` when `None`.
pub fn load_file_with_dir(lua: &Lua, path: &Path, base: Option<LuaTable>) -> LuaResult<LuaValue> {
  let canonical_path = dunce::canonicalize(path)
    .map_err(|e| LuaError::external(format!("cannot resolve '{}': {}", path.display(), e)))?;
  let content = fs::read_to_string(&canonical_path)
    .map_err(|e| LuaError::external(format!("cannot read '{}': {}", canonical_path.display(), e)))?;
  let dir = canonical_path
    .parent()
    .unwrap_or(Path::new("."))
    .to_string_lossy()
    .into_owned();

  let prev_dir: Option<String> = lua.named_registry_value(CURRENT_DIR_KEY)?;
  lua.set_named_registry_value(CURRENT_DIR_KEY, dir.clone())?;

  let result = (|| {
    let env = environment(lua, base, &[("__dir", LuaValue::String(lua.create_string(&dir)?))])?;
    lua
      .load(&content)
      .set_name(format!("@{}", canonical_path.display()))
      .set_environment(env)
      .eval::<LuaValue>()
  })();

  // Restoring must not mask the original error.
  let _ = lua.set_named_registry_value(CURRENT_DIR_KEY, prev_dir);
  result
}

/// Evaluate a Lua expression, or a chunk ending in `return`, with extra
/// variables in scope.
pub fn eval_string(lua: &Lua, source: &str, name: &str, scope: &[(&str, LuaValue)]) -> LuaResult<LuaValue> {
  let env = environment(lua, None, scope)?;
  let as_expression = lua
    .load(format!("return {source}"))
    .set_name(name)
    .set_environment(env.clone())
    .into_function();
  let chunk = match as_expression {
    Ok(chunk) => chunk,
    Err(_) => lua.load(source).set_name(name).set_environment(env).into_function()?,
  };
  chunk.call(())
}

/// An environment table holding `vars` that inherits from `base` or `_G`.
fn environment(lua: &Lua, base: Option<LuaTable>, vars: &[(&str, LuaValue)]) -> LuaResult<LuaTable> {
  let env = lua.create_table()?;
  for (name, value) in vars {
    env.set(*name, value.clone())?;
  }
  let mt = lua.create_table()?;
  let base = base.unwrap_or_else(|| lua.globals());
  mt.set("__index", base)?;
  mt.set("__newindex", lua.globals())?;
  env.set_metatable(Some(mt))?;
  Ok(env)
}

/// `dofile` resolving relative paths against the calling file's `__dir`.
fn create_dofile(lua: &Lua) -> LuaResult<LuaFunction> {
  lua.create_function(|lua, path: Option<String>| {
    let Some(path) = path else {
      return Err(LuaError::external("dofile() without path not supported"));
    };
    let path = Path::new(&path);
    let resolved = match lua.named_registry_value::<Option<String>>(CURRENT_DIR_KEY)? {
      Some(dir) if path.is_relative() => Path::new(&dir).join(path),
      _ => path.to_path_buf(),
    };
    load_file_with_dir(lua, &resolved, None)
  })
}
