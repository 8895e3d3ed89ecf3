//! Shell completion for installables. Nothing here fails: evaluation or
//! locking errors only cut the list of completions short.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::warn;

use super::InstallableError;
use super::flake::default_flake_attr_path_prefixes;
use crate::eval::{EvalState, OrSuggestions, parse_attr_path};
use crate::flake::{FlakeSource, LockFlags, parse_flake_ref};

/// Completions for a partially typed installable.
pub fn complete_installable(state: &EvalState, cwd: &Path, prefix: &str) -> Vec<String> {
  let result = match prefix.split_once('#') {
    Some((flake_part, fragment)) => complete_fragment(state, cwd, flake_part, fragment),
    None => Ok(complete_flake_ref(state, prefix)),
  };
  match result {
    Ok(completions) => completions.into_iter().collect(),
    Err(e) => {
      warn!(prefix = %prefix, error = %e, "completion failed");
      Vec::new()
    }
  }
}

/// Registry entries whose name starts with `prefix`.
fn complete_flake_ref(state: &EvalState, prefix: &str) -> BTreeSet<String> {
  let registries = state.locker().registries();
  registries
    .overrides
    .entries
    .iter()
    .chain(registries.user.entries.iter())
    .filter_map(|entry| match &entry.from.source {
      FlakeSource::Indirect { id, .. } if id.starts_with(prefix) => Some(id.clone()),
      _ => None,
    })
    .collect()
}

/// Attribute names continuing `fragment`, looked up under each prefix the
/// installable would be tried with.
fn complete_fragment(
  state: &EvalState,
  cwd: &Path,
  flake_part: &str,
  fragment: &str,
) -> Result<BTreeSet<String>, InstallableError> {
  let flake_ref = parse_flake_ref(flake_part, Some(cwd))?;
  let flags = LockFlags {
    write_lock_file: false,
    ..LockFlags::default()
  };
  let locked = state.locker().lock(&flake_ref, &flags)?;
  let outputs = state.open_eval_cache(&locked).root_cursor();

  let (roots, exact_marker, fragment) = match fragment.strip_prefix('.') {
    Some(exact) => (vec![String::new()], ".", exact),
    None => {
      let mut roots = default_flake_attr_path_prefixes(&state.settings().system);
      roots.push(String::new());
      (roots, "", fragment)
    }
  };
  let (typed_parent, last) = match fragment.rsplit_once('.') {
    Some((parent, last)) => (format!("{parent}."), last),
    None => (String::new(), fragment),
  };

  let mut completions = BTreeSet::new();
  for root in roots {
    let parent = format!("{root}{typed_parent}");
    let parent_path = parse_attr_path(parent.trim_end_matches('.'))?;
    let cursor = match outputs.find_along_attr_path(&parent_path) {
      Ok(OrSuggestions::Value(cursor)) => cursor,
      Ok(OrSuggestions::Suggestions(_)) => continue,
      Err(e) => {
        warn!(attr = %parent, error = %e, "skipping attribute during completion");
        continue;
      }
    };
    let Ok(names) = cursor.get_attrs() else {
      continue;
    };
    completions.extend(
      names
        .into_iter()
        .filter(|name| name.starts_with(last))
        .map(|name| format!("{flake_part}#{exact_marker}{typed_parent}{name}")),
    );
  }
  Ok(completions)
}
