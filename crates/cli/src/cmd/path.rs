//! Implementation of the `realize path` command: build one installable and
//! print the single store path it produces.

use anyhow::{Context, Result, bail};

use realize_lib::installable::{Installable, OperateOn, Realise, build_activatable, to_store_path, with_activation_attr};
use realize_lib::store::Store;

use super::Session;
use crate::args::InstallableArgs;
use crate::lib_err;
use crate::output::print_warning;

/// Print the store path of one installable.
///
/// With `attr`, the named attribute of the installable's value is used
/// instead, as for the `toplevel` of a system configuration. With
/// `derivation`, the path of the producing derivation is printed and
/// nothing is built.
pub fn cmd_path(args: &InstallableArgs, attr: Option<&str>, derivation: bool) -> Result<()> {
  if args.installables.len() > 1 {
    bail!("'realize path' takes a single installable");
  }
  Session::with_installables(args, |session, installables| {
    let store = session.store.as_ref();
    let installable = match attr {
      Some(attr) => {
        if matches!(installables[0], Installable::DerivedPath(_)) {
          print_warning(&format!("'{}' is a store path, ignoring '--attr {attr}'", installables[0].what()));
        }
        with_activation_attr(&installables[0], attr)
      }
      None => installables[0].clone(),
    };
    let path = if derivation {
      lib_err(to_store_path(
        &session.state,
        store,
        Realise::Derivation,
        OperateOn::Derivation,
        &installable,
      ))?
    } else {
      lib_err(build_activatable(&session.state, store, Realise::Outputs, &installable))
        .with_context(|| format!("Failed to build '{}'", installable.what()))?
    };
    println!("{}", store.store_dir().print_path(&path));
    Ok(())
  })
}
