//! Computing and persisting lock files.
//!
//! Locking walks the declared inputs of a flake:
//! - an input whose old lock entry was recorded for the same declaration is
//!   kept, unless it is overridden or marked for update
//! - anything else is fetched and pinned; flake inputs are locked
//!   recursively, seeded from their own `flake.lock`
//! - relative path inputs are always re-hashed since they live in the
//!   parent's tree
//!
//! A changed lock is written back only when the flags allow it.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info, warn};

use super::fetch::{self, commit_file};
use super::lock_flags::LockFlags;
use super::lockfile::{InputPath, LockFile, LockedNode};
use super::registry::Registries;
use super::{Flake, FlakeError, FlakeInput, FlakeRef, get_flake};
use crate::consts::LOCK_FILE;
use crate::util::hash::hash_bytes;

/// A flake together with its fully resolved lock file.
#[derive(Debug)]
pub struct LockedFlake {
  pub flake: Flake,
  pub lock_file: LockFile,
}

impl LockedFlake {
  /// Identifies the flake's content and every input it can see. `None` when
  /// anything is unlocked, in which case results must not be cached.
  pub fn fingerprint(&self) -> Option<String> {
    if !self.flake.locked_ref.is_locked() || self.lock_file.find_unlocked().is_some() {
      return None;
    }
    let key = format!(
      "{};{};{}",
      self.flake.source_fingerprint,
      self.flake.locked_ref.subdir(),
      self.lock_file
    );
    Some(hash_bytes(key.as_bytes()).0)
  }
}

struct LockContext<'a> {
  flags: &'a LockFlags,
  registries: &'a Registries,
  overrides_used: BTreeSet<InputPath>,
  updates_used: BTreeSet<InputPath>,
  /// Unlocked refs of the flakes currently being locked.
  parents: Vec<FlakeRef>,
}

/// Locks flakes and remembers the results for the rest of the process.
pub struct FlakeLocker {
  cache_dir: PathBuf,
  registries: Registries,
  locked: RefCell<HashMap<(FlakeRef, LockFlags), Rc<LockedFlake>>>,
  sources: RefCell<HashMap<FlakeRef, PathBuf>>,
}

impl FlakeLocker {
  pub fn new(registries: Registries, cache_dir: impl Into<PathBuf>) -> Self {
    Self {
      cache_dir: cache_dir.into(),
      registries,
      locked: RefCell::new(HashMap::new()),
      sources: RefCell::new(HashMap::new()),
    }
  }

  pub fn registries(&self) -> &Registries {
    &self.registries
  }

  pub fn registries_mut(&mut self) -> &mut Registries {
    self.locked.borrow_mut().clear();
    &mut self.registries
  }

  /// Lock `flake_ref`, memoized per (reference, flags).
  pub fn lock(&self, flake_ref: &FlakeRef, flags: &LockFlags) -> Result<Rc<LockedFlake>, FlakeError> {
    let key = (flake_ref.clone(), flags.clone());
    if let Some(locked) = self.locked.borrow().get(&key) {
      return Ok(Rc::clone(locked));
    }
    let locked = Rc::new(self.lock_uncached(flake_ref, flags)?);
    self.locked.borrow_mut().insert(key, Rc::clone(&locked));
    Ok(locked)
  }

  /// Register every top-level input of `flake_ref` as a registry override,
  /// so `flake:<input>` refers to the version that flake pins.
  pub fn inputs_from(&mut self, flake_ref: &FlakeRef) -> Result<(), FlakeError> {
    let locked = self.lock(flake_ref, &LockFlags::default())?;
    let registries = self.registries_mut();
    for (name, node) in &locked.lock_file.inputs {
      debug!(input = %name, to = %node.locked, "adding registry override from flake inputs");
      registries.overrides.add(FlakeRef::indirect(name.clone()), node.locked.clone());
    }
    Ok(())
  }

  /// Directory of a locked input, fetching it on first use.
  pub fn fetch_locked(&self, locked: &FlakeRef) -> Result<PathBuf, FlakeError> {
    if let Some(path) = self.sources.borrow().get(locked) {
      return Ok(path.clone());
    }
    let fetched = fetch::fetch(locked, &self.cache_dir)?;
    let dir = match locked.dir.as_deref() {
      Some(dir) => fetched.path.join(dir),
      None => fetched.path,
    };
    self.sources.borrow_mut().insert(locked.clone(), dir.clone());
    Ok(dir)
  }

  fn lock_uncached(&self, flake_ref: &FlakeRef, flags: &LockFlags) -> Result<LockedFlake, FlakeError> {
    let mut registries = self.registries.clone();
    registries.enabled &= flags.use_registries;

    let flake = get_flake(flake_ref, &registries, &self.cache_dir)?;
    let lock_path = flake.dir().join(LOCK_FILE);

    let old_lock = if flags.recreate_lock_file {
      LockFile::default()
    } else {
      let path = flags.reference_lock_file_path.as_deref().unwrap_or(&lock_path);
      LockFile::read(path)?.unwrap_or_default()
    };

    let mut ctx = LockContext {
      flags,
      registries: &registries,
      overrides_used: BTreeSet::new(),
      updates_used: BTreeSet::new(),
      parents: vec![flake.locked_ref.unlocked()],
    };
    let inputs = self.compute_locks(&mut ctx, &flake.inputs, &InputPath::default(), Some(&old_lock.inputs), &flake.dir())?;
    let new_lock = LockFile { inputs };

    for (path, flake_ref) in &flags.input_overrides {
      if !ctx.overrides_used.contains(path) {
        warn!("the flag '--override-input {path} {flake_ref}' does not match any input");
      }
    }
    for path in &flags.input_updates {
      if !ctx.updates_used.contains(path) {
        warn!("the flag '--update-input {path}' does not match any input");
      }
    }

    if new_lock == old_lock {
      debug!(flake = %flake.resolved_ref, "lock file is up to date");
      self.remember_source(&flake);
      return Ok(LockedFlake {
        flake,
        lock_file: new_lock,
      });
    }

    let changes = LockFile::diff(&old_lock, &new_lock).join("\n");
    if !flags.write_lock_file {
      warn!("not writing modified lock file of flake '{}':\n{changes}", flake.original_ref);
    } else if let Some(unlocked) = new_lock.find_unlocked() {
      warn!(
        "will not write lock file of flake '{}' because it has an unlocked input ('{unlocked}')",
        flake.original_ref
      );
    } else {
      if !flags.update_lock_file {
        return Err(FlakeError::UpdateForbidden(flake.original_ref.to_string()));
      }
      let output = match &flags.output_lock_file_path {
        Some(path) => path.clone(),
        None if flake.is_local() => lock_path.clone(),
        None => return Err(FlakeError::CannotWriteLock(flake.original_ref.to_string())),
      };
      if old_lock.inputs.is_empty() && !output.exists() {
        warn!("creating lock file '{}':\n{changes}", output.display());
      } else {
        warn!("updating lock file '{}':\n{changes}", output.display());
      }
      new_lock.write(&output)?;
      info!(path = %output.display(), "wrote lock file");

      if flags.commit_lock_file {
        let message = format!("{LOCK_FILE}: Update\n\nFlake lock file updates:\n\n{changes}");
        commit_file(&flake.dir(), &output, &message)?;
      }

      if output == lock_path {
        // The lock file is part of the flake's own source tree.
        let flake = get_flake(flake_ref, &registries, &self.cache_dir)?;
        self.remember_source(&flake);
        return Ok(LockedFlake {
          flake,
          lock_file: new_lock,
        });
      }
    }

    self.remember_source(&flake);
    Ok(LockedFlake {
      flake,
      lock_file: new_lock,
    })
  }

  fn compute_locks(
    &self,
    ctx: &mut LockContext<'_>,
    inputs: &BTreeMap<String, FlakeInput>,
    prefix: &InputPath,
    old_inputs: Option<&BTreeMap<String, LockedNode>>,
    parent_dir: &Path,
  ) -> Result<BTreeMap<String, LockedNode>, FlakeError> {
    let mut out = BTreeMap::new();

    for (name, input) in inputs {
      let path = prefix.child(name);
      let overridden = ctx.flags.input_overrides.get(&path);
      if overridden.is_some() {
        ctx.overrides_used.insert(path.clone());
      }
      let update = ctx.flags.input_updates.contains(&path);
      if update {
        ctx.updates_used.insert(path.clone());
      }

      let original = overridden.cloned().unwrap_or_else(|| input.flake_ref.clone());
      let old = old_inputs
        .and_then(|m| m.get(name))
        .filter(|old| overridden.is_none() && !update && old.original == original);

      let node = match old {
        Some(old) if !original.is_relative_path() && !(old.is_flake && ctx.flags.touches_below(&path)) => {
          debug!(input = %path, "keeping locked input");
          old.clone()
        }
        Some(old) => {
          let fetch_ref = if original.is_relative_path() {
            &original
          } else {
            &old.locked
          };
          self.lock_input(ctx, &path, fetch_ref, &original, old.is_flake, Some(&old.inputs), parent_dir)?
        }
        None => {
          debug!(input = %path, flake_ref = %original, "locking input");
          self.lock_input(ctx, &path, &original, &original, input.is_flake, None, parent_dir)?
        }
      };
      out.insert(name.clone(), node);
    }

    Ok(out)
  }

  #[allow(clippy::too_many_arguments)]
  fn lock_input(
    &self,
    ctx: &mut LockContext<'_>,
    path: &InputPath,
    fetch_ref: &FlakeRef,
    original: &FlakeRef,
    is_flake: bool,
    old_children: Option<&BTreeMap<String, LockedNode>>,
    parent_dir: &Path,
  ) -> Result<LockedNode, FlakeError> {
    let fetch_ref = fetch_ref.resolve_relative(parent_dir);

    if !is_flake {
      let resolved = ctx.registries.lookup(&fetch_ref)?;
      let fetched = fetch::fetch(&resolved, &self.cache_dir)?;
      self.sources.borrow_mut().insert(fetched.locked.clone(), fetched.path);
      return Ok(LockedNode {
        locked: fetched.locked,
        original: original.clone(),
        is_flake: false,
        inputs: BTreeMap::new(),
      });
    }

    let flake = get_flake(&fetch_ref, ctx.registries, &self.cache_dir)?;
    let key = flake.locked_ref.unlocked();
    if ctx.parents.contains(&key) {
      return Err(FlakeError::CircularImport(flake.resolved_ref.to_string()));
    }

    let own_lock = match old_children {
      Some(_) => None,
      None => LockFile::read(&flake.dir().join(LOCK_FILE))?,
    };
    let old_children = old_children.or(own_lock.as_ref().map(|lock| &lock.inputs));

    ctx.parents.push(key);
    let children = self.compute_locks(ctx, &flake.inputs, path, old_children, &flake.dir());
    ctx.parents.pop();

    self.remember_source(&flake);
    Ok(LockedNode {
      locked: flake.locked_ref,
      original: original.clone(),
      is_flake: true,
      inputs: children?,
    })
  }

  fn remember_source(&self, flake: &Flake) {
    self
      .sources
      .borrow_mut()
      .insert(flake.locked_ref.clone(), flake.dir());
  }
}
