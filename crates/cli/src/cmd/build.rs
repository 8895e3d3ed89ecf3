//! Implementation of the `realize build` command.
//!
//! Builds the installables and links their outputs into the current
//! directory: `result`, `result-<output>`, `result-<n>` for later ones.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use realize_lib::derived::{BuiltPath, DerivedPath};
use realize_lib::eval::EvalMode;
use realize_lib::installable::{BuiltPathWithResult, Installable, Realise, build};
use realize_lib::store::{BuildMode, Store, StoreDir};

use super::Session;
use crate::args::InstallableArgs;
use crate::lib_err;
use crate::output::{format_duration, print_info, print_item, print_json, print_link, print_success};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
  pub dry_run: bool,
  pub json: bool,
  pub print_out_paths: bool,
  pub no_link: bool,
  pub out_link: Option<PathBuf>,
  pub build_mode: BuildMode,
}

pub fn cmd_build(args: &InstallableArgs, options: &BuildOptions) -> Result<()> {
  Session::with_installables(args, |session, installables| {
    if options.dry_run {
      return dry_run(session, &installables);
    }

    let start = Instant::now();
    let store = session.store.as_ref();
    let results = lib_err(build(
      &session.state,
      store,
      Realise::Outputs,
      &installables,
      options.build_mode,
    ))
    .context("Build failed")?;
    info!(paths = results.len(), elapsed = %format_duration(start.elapsed()), "build finished");

    if options.json {
      let json: Vec<Value> = results.iter().map(|r| r.path.to_json(store.store_dir())).collect();
      print_json(&json)?;
    } else if options.print_out_paths {
      for result in &results {
        for path in result.path.out_paths() {
          println!("{}", store.store_dir().print_path(&path));
        }
      }
    }

    if !options.no_link {
      let base = options.out_link.clone().unwrap_or_else(|| PathBuf::from("result"));
      let links = out_links(&base, &results);
      for (link, path) in &links {
        let link = session.cwd.join(link);
        create_link(&link, &store.store_dir().to_path(path))?;
        if !options.json {
          print_link(&link.display().to_string(), &store.store_dir().print_path(path));
        }
      }
    }

    if !options.json {
      print_success(&format!("Built {} path(s) in {}", results.len(), format_duration(start.elapsed())));
    }
    Ok(())
  })
}

/// Report what building would involve without building anything.
fn dry_run(session: &Session, installables: &[Installable]) -> Result<()> {
  let mut paths: Vec<DerivedPath> = Vec::new();
  for installable in installables {
    let derived = lib_err(installable.to_derived_paths(&session.state, EvalMode::default()))?;
    paths.extend(derived.into_iter().map(|d| d.path));
  }
  let store = session.store.as_ref();
  let missing = lib_err(store.query_missing(&paths))?;
  let store_dir = store.store_dir();

  if missing.will_build.is_empty() && missing.unknown.is_empty() {
    print_info("Nothing to build");
  }
  if !missing.will_build.is_empty() {
    print_info(&format!("these {} derivation(s) would be built:", missing.will_build.len()));
    print_paths(store_dir, missing.will_build.iter());
  }
  if !missing.unknown.is_empty() {
    print_info(&format!("don't know how to build these {} path(s):", missing.unknown.len()));
    print_paths(store_dir, missing.unknown.iter());
  }
  Ok(())
}

fn print_paths<'a>(store_dir: &StoreDir, paths: impl Iterator<Item = &'a realize_lib::store::StorePath>) {
  for path in paths {
    print_item(&store_dir.print_path(path));
  }
}

/// Link names for every output, numbered after the first result.
fn out_links(base: &Path, results: &[BuiltPathWithResult]) -> Vec<(PathBuf, realize_lib::store::StorePath)> {
  let mut links = Vec::new();
  for (i, result) in results.iter().enumerate() {
    let mut name = base.as_os_str().to_owned();
    if i > 0 {
      name.push(format!("-{i}"));
    }
    match &result.path {
      BuiltPath::Opaque(path) => links.push((PathBuf::from(&name), path.clone())),
      BuiltPath::Built { outputs, .. } => {
        for (output, path) in outputs {
          let mut output_name = name.clone();
          if output != "out" {
            output_name.push(format!("-{output}"));
          }
          links.push((PathBuf::from(output_name), path.clone()));
        }
      }
    }
  }
  links
}

/// Point `link` at `target`, replacing an existing link.
fn create_link(link: &Path, target: &Path) -> Result<()> {
  if link.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
    std::fs::remove_file(link).with_context(|| format!("Failed to remove old link {}", link.display()))?;
  }
  symlink(target, link).with_context(|| format!("Failed to create link {}", link.display()))
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
  if target.is_dir() {
    std::os::windows::fs::symlink_dir(target, link)
  } else {
    std::os::windows::fs::symlink_file(target, link)
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use realize_lib::derived::SingleBuiltPath;
  use realize_lib::store::StorePath;

  use super::*;

  const HASH: &str = "0123456789abcdef0123456789abcdef";

  fn path(name: &str) -> StorePath {
    StorePath::from_base_name(&format!("{HASH}-{name}")).unwrap()
  }

  fn built(outputs: &[(&str, &str)]) -> BuiltPathWithResult {
    BuiltPathWithResult {
      path: BuiltPath::Built {
        drv_path: SingleBuiltPath::Opaque(path("pkg.drv")),
        outputs: outputs
          .iter()
          .map(|(output, name)| (output.to_string(), path(name)))
          .collect::<BTreeMap<_, _>>(),
      },
      info: Default::default(),
      result: None,
    }
  }

  #[test]
  fn link_names() {
    let results = vec![
      built(&[("out", "pkg"), ("dev", "pkg-dev")]),
      BuiltPathWithResult {
        path: BuiltPath::Opaque(path("src")),
        info: Default::default(),
        result: None,
      },
    ];
    let links: Vec<String> = out_links(Path::new("result"), &results)
      .into_iter()
      .map(|(link, _)| link.display().to_string())
      .collect();
    assert_eq!(links, vec!["result-dev", "result", "result-1"]);
  }

  #[test]
  fn custom_out_link() {
    let links = out_links(Path::new("out/app"), &[built(&[("bin", "pkg-bin")])]);
    assert_eq!(links[0].0, PathBuf::from("out/app-bin"));
    assert_eq!(links[0].1, path("pkg-bin"));
  }

  #[test]
  fn links_are_replaced() {
    let temp = tempfile::TempDir::new().unwrap();
    let a = temp.path().join("a");
    let b = temp.path().join("b");
    std::fs::write(&a, "a").unwrap();
    std::fs::write(&b, "b").unwrap();
    let link = temp.path().join("result");
    create_link(&link, &a).unwrap();
    create_link(&link, &b).unwrap();
    assert_eq!(std::fs::read_to_string(&link).unwrap(), "b");
  }
}
