//! Implementation of the `realize drv-path` command.

use anyhow::Result;

use realize_lib::installable::to_derivations;
use realize_lib::store::Store;

use super::Session;
use crate::args::InstallableArgs;
use crate::lib_err;

/// Print the derivations producing the installables. Store paths that are
/// build outputs map to the derivation that built them.
pub fn cmd_drv_path(args: &InstallableArgs) -> Result<()> {
  Session::with_installables(args, |session, installables| {
    let store = session.store.as_ref();
    let drv_paths = lib_err(to_derivations(&session.state, store, &installables, true))?;
    for drv_path in drv_paths {
      println!("{}", store.store_dir().print_path(&drv_path));
    }
    Ok(())
  })
}
