mod build;
mod complete;
mod drv_path;
mod lock;
mod path;

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::debug;

use realize_lib::eval::EvalState;
use realize_lib::flake::{FlakeLocker, Registries, parse_flake_ref};
use realize_lib::installable::{Installable, InstallableParser};
use realize_lib::platform::paths;
use realize_lib::store::{LocalStore, Store};

use crate::args::{EvalArgs, InstallableArgs, LockArgs};
use crate::lib_err;

pub use build::{BuildOptions, cmd_build};
pub use complete::cmd_complete;
pub use drv_path::cmd_drv_path;
pub use lock::cmd_lock;
pub use path::cmd_path;

/// The store and evaluator one command works with.
pub struct Session {
  pub store: Rc<LocalStore>,
  pub state: EvalState,
  pub cwd: PathBuf,
}

impl Session {
  pub fn open(eval: &EvalArgs, lock: &LockArgs, impure: bool) -> Result<Self> {
    let cwd = std::env::current_dir().context("Failed to determine the current directory")?;
    let store = Rc::new(lib_err(LocalStore::open_default()).context("Failed to open the store")?);
    debug!(store = %store.store_dir(), "opened store");

    let mut registries = lib_err(Registries::load()).context("Failed to read the flake registry")?;
    registries.enabled = !lock.no_registries;
    for pair in lock.override_flake.chunks_exact(2) {
      let from = lib_err(parse_flake_ref(&pair[0], Some(&cwd)))?;
      let to = lib_err(parse_flake_ref(&pair[1], Some(&cwd)))?;
      registries.overrides.add(from, to);
    }
    let mut locker = FlakeLocker::new(registries, paths::cache_dir());
    if let Some(flake_ref) = &lock.inputs_from {
      let flake_ref = lib_err(parse_flake_ref(flake_ref, Some(&cwd)))?;
      lib_err(locker.inputs_from(&flake_ref)).context("Failed to read inputs")?;
    }

    let state = lib_err(EvalState::new(store.clone(), Rc::new(locker), eval.to_settings(impure)))?;
    Ok(Self { store, state, cwd })
  }

  /// Open a session for `args` and parse its installables.
  pub fn with_installables<T>(
    args: &InstallableArgs,
    f: impl FnOnce(&Session, Vec<Installable>) -> Result<T>,
  ) -> Result<T> {
    let session = Self::open(&args.eval, &args.lock, args.source.is_impure())?;
    let parser = InstallableParser::new(&session.state, &session.cwd)
      .with_source(args.source.to_source())
      .with_modifiers(args.modifiers.to_modifiers())
      .with_lock_flags(args.lock.to_flags(&session.cwd)?);
    let installables = lib_err(parser.parse(&args.installables()))?;
    f(&session, installables)
  }
}
