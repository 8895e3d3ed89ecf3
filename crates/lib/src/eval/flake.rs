//! Evaluating locked flakes.
//!
//! A flake's `outputs` function receives its inputs as a lazy table: an
//! input is fetched and, for flake inputs, evaluated only when first
//! accessed. Evaluated inputs are shared by locked reference, so two flakes
//! depending on the same pinned input see the same value.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::debug;

use super::runtime::load_file_with_dir;
use crate::consts::FLAKE_FILE;
use crate::flake::{FlakeLocker, FlakeRef, LockedFlake, LockedNode};

#[derive(Clone)]
pub(super) struct FlakeEvaluator {
  pub lua: Lua,
  pub locker: Rc<FlakeLocker>,
  /// Globals visible to flake files.
  pub env: Option<LuaTable>,
  inputs: Rc<RefCell<HashMap<FlakeRef, LuaValue>>>,
}

impl FlakeEvaluator {
  pub fn new(lua: Lua, locker: Rc<FlakeLocker>, env: Option<LuaTable>) -> Self {
    Self {
      lua,
      locker,
      env,
      inputs: Rc::new(RefCell::new(HashMap::new())),
    }
  }

  /// The outputs table of a locked top-level flake.
  pub fn outputs(&self, locked: &LockedFlake) -> LuaResult<LuaValue> {
    debug!(flake = %locked.flake.locked_ref, "evaluating flake outputs");
    let inputs = self.inputs_table(&locked.lock_file.inputs)?;
    self.call_outputs(&locked.flake.dir(), inputs)
  }

  fn call_outputs(&self, dir: &Path, inputs: LuaTable) -> LuaResult<LuaValue> {
    let flake: LuaTable = match load_file_with_dir(&self.lua, &dir.join(FLAKE_FILE), self.env.clone())? {
      LuaValue::Table(t) => t,
      _ => return Err(LuaError::external(format!("{FLAKE_FILE} must return a table"))),
    };
    let outputs_fn: LuaFunction = flake.get("outputs")?;
    let call_flake: LuaFunction = self.native()?.get("call_flake")?;
    call_flake.call((outputs_fn, inputs, dir.to_string_lossy().into_owned()))
  }

  fn inputs_table(&self, nodes: &BTreeMap<String, LockedNode>) -> LuaResult<LuaTable> {
    let loaders = self.lua.create_table()?;
    for (name, node) in nodes {
      let this = self.clone();
      let node = node.clone();
      loaders.set(
        name.as_str(),
        self.lua.create_function(move |_, ()| this.input_value(&node))?,
      )?;
    }
    let lazy_table: LuaFunction = self.native()?.get("lazy_table")?;
    lazy_table.call(loaders)
  }

  fn input_value(&self, node: &LockedNode) -> LuaResult<LuaValue> {
    if let Some(value) = self.inputs.borrow().get(&node.locked) {
      return Ok(value.clone());
    }
    let dir = self.locker.fetch_locked(&node.locked).map_err(LuaError::external)?;
    let out_path = dir.to_string_lossy().into_owned();
    let native = self.native()?;

    let value: LuaValue = if node.is_flake {
      debug!(input = %node.locked, "evaluating flake input");
      let inputs = self.inputs_table(&node.inputs)?;
      let outputs = self.call_outputs(&dir, inputs.clone())?;
      native
        .get::<LuaFunction>("flake_value")?
        .call((outputs, out_path, inputs))?
    } else {
      native.get::<LuaFunction>("source_value")?.call(out_path)?
    };
    self.inputs.borrow_mut().insert(node.locked.clone(), value.clone());
    Ok(value)
  }

  fn native(&self) -> LuaResult<LuaTable> {
    self.lua.globals().get("__realize")
  }
}
