//! Lazy, cached navigation of evaluated values.
//!
//! An [`EvalCache`] owns a root value that is only computed when something
//! actually needs it. [`AttrCursor`]s name attribute paths below the root;
//! asking a cursor a question (its attribute names, its string value, ...)
//! first consults the cache database, if there is one, and evaluates only
//! on a miss. Answers from live evaluation are recorded for next time.
//!
//! A database only ever holds entries for one flake fingerprint, so a
//! cached answer is always valid for the value being navigated.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::trace;

use super::attr_path::show_attr_path;
use super::cache_db::{AttrKey, CachedValue, EvalCacheDb};
use super::runtime::force;
use super::suggestions::{OrSuggestions, Suggestions};
use super::EvalError;

/// Computes the root value on first use.
pub type RootLoader = Box<dyn FnOnce() -> LuaResult<LuaValue>>;

enum Root {
  Pending(RootLoader),
  Forced(LuaValue),
  Failed(LuaError),
  Forcing,
}

pub struct EvalCache {
  lua: Lua,
  db: Option<Rc<dyn EvalCacheDb>>,
  allow_eval: bool,
  root: RefCell<Root>,
  values: RefCell<HashMap<AttrKey, LuaValue>>,
}

impl EvalCache {
  pub fn new(lua: Lua, db: Option<Rc<dyn EvalCacheDb>>, allow_eval: bool, root: RootLoader) -> Rc<Self> {
    Rc::new(Self {
      lua,
      db,
      allow_eval,
      root: RefCell::new(Root::Pending(root)),
      values: RefCell::new(HashMap::new()),
    })
  }

  /// An uncached cache over an already computed value.
  pub fn from_value(lua: Lua, value: LuaValue) -> Rc<Self> {
    Rc::new(Self {
      lua,
      db: None,
      allow_eval: true,
      root: RefCell::new(Root::Forced(value)),
      values: RefCell::new(HashMap::new()),
    })
  }

  pub fn root_cursor(self: &Rc<Self>) -> AttrCursor {
    AttrCursor {
      cache: Rc::clone(self),
      path: Vec::new(),
    }
  }

  pub fn is_cached(&self) -> bool {
    self.db.is_some()
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  fn force_root(&self) -> LuaResult<LuaValue> {
    let state = std::mem::replace(&mut *self.root.borrow_mut(), Root::Forcing);
    let (next, result) = match state {
      Root::Pending(load) => match load() {
        Ok(value) => (Root::Forced(value.clone()), Ok(value)),
        Err(e) => (Root::Failed(e.clone()), Err(e)),
      },
      Root::Forced(value) => (Root::Forced(value.clone()), Ok(value)),
      Root::Failed(e) => (Root::Failed(e.clone()), Err(e)),
      Root::Forcing => (
        Root::Forcing,
        Err(LuaError::external("infinite recursion while evaluating the root value")),
      ),
    };
    *self.root.borrow_mut() = next;
    result
  }

  fn live_value(&self, path: &[String]) -> Result<LuaValue, EvalError> {
    if let Some(value) = self.values.borrow().get(path) {
      return Ok(value.clone());
    }
    let value = match path.split_last() {
      None => self.force_root()?,
      Some((name, parent_path)) => match self.live_value(parent_path)? {
        LuaValue::Table(parent) => force(&self.lua, parent.get::<LuaValue>(name.as_str())?)?,
        other => {
          return Err(EvalError::TypeError {
            path: show_attr_path(parent_path),
            expected: "a set",
            actual: other.type_name().to_string(),
          });
        }
      },
    };
    self.values.borrow_mut().insert(path.to_vec(), value.clone());
    Ok(value)
  }

  fn get(&self, key: &AttrKey) -> Option<CachedValue> {
    self.db.as_ref()?.get(key)
  }

  fn put(&self, key: &AttrKey, value: CachedValue) {
    if let Some(db) = &self.db {
      db.put(key.clone(), value);
    }
  }
}

/// An attribute path below the root of an [`EvalCache`].
#[derive(Clone)]
pub struct AttrCursor {
  cache: Rc<EvalCache>,
  path: AttrKey,
}

impl std::fmt::Debug for AttrCursor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AttrCursor")
      .field("path", &self.attr_path_string())
      .field("cached", &self.cache.is_cached())
      .finish()
  }
}

impl AttrCursor {
  pub fn path(&self) -> &[String] {
    &self.path
  }

  pub fn attr_path_string(&self) -> String {
    show_attr_path(&self.path)
  }

  pub fn cache(&self) -> &Rc<EvalCache> {
    &self.cache
  }

  fn child(&self, name: &str) -> AttrCursor {
    let mut path = self.path.clone();
    path.push(name.to_string());
    AttrCursor {
      cache: Rc::clone(&self.cache),
      path,
    }
  }

  /// Evaluate the value this cursor names.
  pub fn value(&self) -> Result<LuaValue, EvalError> {
    if self.cache.is_cached() && !self.cache.allow_eval {
      return Err(EvalError::CacheMiss(self.attr_path_string()));
    }
    trace!(attr = %self.attr_path_string(), "evaluating attribute");
    self.cache.live_value(&self.path).inspect_err(|e| {
      if matches!(e, EvalError::Lua(_)) {
        self.cache.put(&self.path, CachedValue::Failed);
      }
    })
  }

  /// The cached entry for this cursor, if it can be used. A recorded
  /// failure is re-evaluated to recover the real error.
  fn cached(&self) -> Result<Option<CachedValue>, EvalError> {
    match self.cache.get(&self.path) {
      Some(CachedValue::Failed) if !self.cache.allow_eval => Err(EvalError::CachedFailure(self.attr_path_string())),
      Some(CachedValue::Failed) => Ok(None),
      other => Ok(other),
    }
  }

  pub fn maybe_get_attr(&self, name: &str) -> Result<Option<AttrCursor>, EvalError> {
    let child = self.child(name);
    if self.cache.get(&child.path) == Some(CachedValue::Missing) {
      return Ok(None);
    }
    let names = self.get_attrs()?;
    if names.iter().any(|n| n == name) {
      Ok(Some(child))
    } else {
      self.cache.put(&child.path, CachedValue::Missing);
      Ok(None)
    }
  }

  pub fn get_attr(&self, name: &str) -> Result<AttrCursor, EvalError> {
    match self.maybe_get_attr(name)? {
      Some(child) => Ok(child),
      None => Err(EvalError::AttrMissing {
        attr: name.to_string(),
        path: self.attr_path_string(),
        suggestions: Suggestions::best_matches(self.get_attrs()?, name).trim(5, 2),
      }),
    }
  }

  /// Follow `path`, or explain with near matches where it stops.
  pub fn find_along_attr_path(&self, path: &[String]) -> Result<OrSuggestions<AttrCursor>, EvalError> {
    let mut cursor = self.clone();
    for name in path {
      match cursor.maybe_get_attr(name)? {
        Some(child) => cursor = child,
        None => {
          let suggestions = Suggestions::best_matches(cursor.get_attrs()?, name).trim(5, 2);
          return Ok(OrSuggestions::Suggestions(suggestions));
        }
      }
    }
    Ok(OrSuggestions::Value(cursor))
  }

  /// Sorted attribute names of a set.
  pub fn get_attrs(&self) -> Result<Vec<String>, EvalError> {
    self.get_as(
      "a set",
      |cached| match cached {
        CachedValue::Attrs(names) => Some(names),
        _ => None,
      },
      |lua, value| match value {
        LuaValue::Table(t) => {
          let attr_names: LuaFunction = lua.globals().get::<LuaTable>("__realize")?.get("attr_names")?;
          let names: Vec<String> = attr_names.call(t.clone())?;
          Ok(Some((names.clone(), CachedValue::Attrs(names))))
        }
        _ => Ok(None),
      },
    )
  }

  pub fn get_string(&self) -> Result<String, EvalError> {
    self.get_as(
      "a string",
      |cached| match cached {
        CachedValue::String(s) => Some(s),
        _ => None,
      },
      |_, value| match value {
        LuaValue::String(s) => {
          let s = s.to_str()?.to_string();
          Ok(Some((s.clone(), CachedValue::String(s))))
        }
        _ => Ok(None),
      },
    )
  }

  /// Evaluate a string bypassing the cache database, recording the result.
  pub fn get_string_live(&self) -> Result<String, EvalError> {
    match self.value()? {
      LuaValue::String(s) => {
        let s = s.to_str()?.to_string();
        self.cache.put(&self.path, CachedValue::String(s.clone()));
        Ok(s)
      }
      other => Err(self.type_error("a string", other.type_name())),
    }
  }

  pub fn get_bool(&self) -> Result<bool, EvalError> {
    self.get_as(
      "a Boolean",
      |cached| match cached {
        CachedValue::Bool(b) => Some(b),
        _ => None,
      },
      |_, value| match value {
        LuaValue::Boolean(b) => Ok(Some((*b, CachedValue::Bool(*b)))),
        _ => Ok(None),
      },
    )
  }

  pub fn get_int(&self) -> Result<i64, EvalError> {
    self.get_as(
      "an integer",
      |cached| match cached {
        CachedValue::Int(i) => Some(i),
        _ => None,
      },
      |_, value| match value {
        LuaValue::Integer(i) => Ok(Some((*i, CachedValue::Int(*i)))),
        _ => Ok(None),
      },
    )
  }

  pub fn get_list_of_strings(&self) -> Result<Vec<String>, EvalError> {
    self.get_as(
      "a list of strings",
      |cached| match cached {
        CachedValue::ListOfStrings(items) => Some(items),
        _ => None,
      },
      |_, value| match value {
        LuaValue::Table(t) => {
          let items = t
            .sequence_values::<LuaValue>()
            .map(|item| match item? {
              LuaValue::String(s) => Ok(Some(s.to_str()?.to_string())),
              _ => Ok(None),
            })
            .collect::<LuaResult<Option<Vec<String>>>>()?;
          Ok(items.map(|items| (items.clone(), CachedValue::ListOfStrings(items))))
        }
        _ => Ok(None),
      },
    )
  }

  pub fn is_derivation(&self) -> Result<bool, EvalError> {
    let names = match self.get_attrs() {
      Ok(names) => names,
      Err(EvalError::TypeError { .. }) => return Ok(false),
      Err(e) => return Err(e),
    };
    if !names.iter().any(|n| n == "type") {
      return Ok(false);
    }
    match self.child("type").get_string() {
      Ok(ty) => Ok(ty == "derivation"),
      Err(EvalError::TypeError { .. }) => Ok(false),
      Err(e) => Err(e),
    }
  }

  pub fn is_attrs(&self) -> Result<bool, EvalError> {
    match self.get_attrs() {
      Ok(_) => Ok(true),
      Err(EvalError::TypeError { .. }) => Ok(false),
      Err(e) => Err(e),
    }
  }

  fn get_as<T>(
    &self,
    expected: &'static str,
    from_cache: impl Fn(CachedValue) -> Option<T>,
    from_value: impl Fn(&Lua, &LuaValue) -> LuaResult<Option<(T, CachedValue)>>,
  ) -> Result<T, EvalError> {
    if let Some(cached) = self.cached()? {
      let kind = describe(&cached);
      if cached == CachedValue::Missing {
        return Err(EvalError::AttrMissing {
          attr: self.path.last().cloned().unwrap_or_default(),
          path: show_attr_path(&self.path[..self.path.len().saturating_sub(1)]),
          suggestions: Suggestions::default(),
        });
      }
      return match from_cache(cached) {
        Some(value) => Ok(value),
        None if kind == "a value" => self.get_as_live(expected, from_value),
        None => Err(self.type_error(expected, kind)),
      };
    }
    self.get_as_live(expected, from_value)
  }

  fn get_as_live<T>(
    &self,
    expected: &'static str,
    from_value: impl Fn(&Lua, &LuaValue) -> LuaResult<Option<(T, CachedValue)>>,
  ) -> Result<T, EvalError> {
    let value = self.value()?;
    match from_value(&self.cache.lua, &value)? {
      Some((result, cached)) => {
        self.cache.put(&self.path, cached);
        Ok(result)
      }
      None => {
        if !matches!(value, LuaValue::Table(_)) {
          self.cache.put(&self.path, CachedValue::Misc);
        }
        Err(self.type_error(expected, value.type_name()))
      }
    }
  }

  fn type_error(&self, expected: &'static str, actual: &str) -> EvalError {
    EvalError::TypeError {
      path: self.attr_path_string(),
      expected,
      actual: actual.to_string(),
    }
  }
}

fn describe(value: &CachedValue) -> &'static str {
  match value {
    CachedValue::Attrs(_) => "a set",
    CachedValue::String(_) => "a string",
    CachedValue::Bool(_) => "a Boolean",
    CachedValue::Int(_) => "an integer",
    CachedValue::ListOfStrings(_) => "a list of strings",
    CachedValue::Missing => "a missing attribute",
    CachedValue::Failed => "a failed evaluation",
    CachedValue::Misc => "a value",
  }
}
