//! Implementation of the `realize lock` command.

use anyhow::{Context, Result};
use owo_colors::OwoColorize;

use realize_lib::flake::parse_flake_ref;

use super::Session;
use crate::args::{EvalArgs, LockArgs};
use crate::lib_err;
use crate::output::print_success;

/// Lock a flake, creating or updating its lock file as the flags allow.
pub fn cmd_lock(flake_ref: &str, lock: &LockArgs, json: bool) -> Result<()> {
  let session = Session::open(&EvalArgs::default(), lock, false)?;
  let flake_ref = lib_err(parse_flake_ref(flake_ref, Some(&session.cwd)))?;
  let flags = lock.to_flags(&session.cwd)?;
  let locked = lib_err(session.state.locker().lock(&flake_ref, &flags))
    .with_context(|| format!("Failed to lock '{flake_ref}'"))?;

  if json {
    print!("{}", locked.lock_file);
    return Ok(());
  }
  print_success(&format!("Locked {}", locked.flake.locked_ref.to_string().cyan()));
  for (name, node) in &locked.lock_file.inputs {
    eprintln!("  {}: {}", name.cyan(), node.locked);
  }
  Ok(())
}
