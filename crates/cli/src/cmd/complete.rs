use anyhow::Result;

use realize_lib::installable::complete_installable;

use super::Session;
use crate::args::{EvalArgs, LockArgs};

/// Print completions of a partially typed installable, one per line.
pub fn cmd_complete(prefix: &str) -> Result<()> {
  let session = Session::open(&EvalArgs::default(), &LockArgs::default(), false)?;
  for completion in complete_installable(&session.state, &session.cwd, prefix) {
    println!("{completion}");
  }
  Ok(())
}
