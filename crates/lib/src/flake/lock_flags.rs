use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::flakeref::FlakeRef;
use super::lockfile::InputPath;

/// How a flake's lock file may be computed and persisted.
///
/// Flags are part of the memo key for locked flakes, so two installables
/// locking the same flake with the same flags share one [`LockedFlake`].
///
/// [`LockedFlake`]: super::LockedFlake
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockFlags {
  /// Ignore the existing lock file entirely.
  pub recreate_lock_file: bool,
  /// Allow the lock to change. When false, any change is an error.
  pub update_lock_file: bool,
  /// Persist a changed lock.
  pub write_lock_file: bool,
  /// Commit a written lock file with `git`.
  pub commit_lock_file: bool,
  /// Resolve indirect references through the registries.
  pub use_registries: bool,
  /// Replace inputs (at any depth) with other references.
  pub input_overrides: BTreeMap<InputPath, FlakeRef>,
  /// Inputs to re-lock even if the lock file pins them.
  pub input_updates: BTreeSet<InputPath>,
  /// Read the old lock from here instead of the flake's `flake.lock`.
  pub reference_lock_file_path: Option<PathBuf>,
  /// Write the new lock here instead of the flake's `flake.lock`.
  pub output_lock_file_path: Option<PathBuf>,
}

impl Default for LockFlags {
  fn default() -> Self {
    Self {
      recreate_lock_file: false,
      update_lock_file: true,
      write_lock_file: true,
      commit_lock_file: false,
      use_registries: true,
      input_overrides: BTreeMap::new(),
      input_updates: BTreeSet::new(),
      reference_lock_file_path: None,
      output_lock_file_path: None,
    }
  }
}

impl LockFlags {
  pub fn override_input(&mut self, path: InputPath, flake_ref: FlakeRef) {
    // An overridden lock does not describe the flake as written.
    self.write_lock_file = false;
    self.input_overrides.insert(path, flake_ref);
  }

  /// Whether an override or update names an input strictly below `path`.
  pub(crate) fn touches_below(&self, path: &InputPath) -> bool {
    self
      .input_overrides
      .keys()
      .chain(self.input_updates.iter())
      .any(|p| p != path && path.is_prefix_of(p))
  }
}
