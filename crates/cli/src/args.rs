//! Argument groups shared by the installable-taking commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::Args;

use realize_lib::eval::{AutoArg, AutoArgs, EvalSettings};
use realize_lib::flake::{InputPath, LockFlags, parse_flake_ref};
use realize_lib::installable::{Modifiers, OverrideArg, SourceExprArgs};

use crate::lib_err;

/// Installables plus everything that affects how they are interpreted.
#[derive(Args, Debug, Clone, Default)]
pub struct InstallableArgs {
  /// Flake references, attribute paths or store paths
  #[arg(value_name = "INSTALLABLES")]
  pub installables: Vec<String>,

  #[command(flatten)]
  pub source: SourceArgs,

  #[command(flatten)]
  pub modifiers: ModifierArgs,

  #[command(flatten)]
  pub lock: LockArgs,

  #[command(flatten)]
  pub eval: EvalArgs,
}

impl InstallableArgs {
  /// The installables to use, `.` when none are given.
  pub fn installables(&self) -> Vec<String> {
    if self.installables.is_empty() {
      vec![".".to_string()]
    } else {
      self.installables.clone()
    }
  }
}

#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
  /// Interpret installables as attribute paths of the value of this file (`-` for stdin)
  #[arg(short, long, value_name = "FILE")]
  pub file: Option<PathBuf>,

  /// Interpret installables as attribute paths of the value of this expression
  #[arg(long, value_name = "EXPR")]
  pub expr: Option<String>,

  /// Call the function in FILE with the default flake's packages
  #[arg(long, value_name = "FILE")]
  pub call_package: Option<PathBuf>,

  /// Pass the value of EXPR as argument NAME to the evaluated function
  #[arg(long, num_args = 2, value_names = ["NAME", "EXPR"])]
  pub arg: Vec<String>,

  /// Pass the string VALUE as argument NAME to the evaluated function
  #[arg(long, num_args = 2, value_names = ["NAME", "VALUE"])]
  pub argstr: Vec<String>,
}

impl SourceArgs {
  pub fn to_source(&self) -> SourceExprArgs {
    let mut auto_args = AutoArgs::new();
    for (name, expr) in pairs(&self.arg) {
      auto_args.insert(name, AutoArg::Expr(expr));
    }
    for (name, value) in pairs(&self.argstr) {
      auto_args.insert(name, AutoArg::String(value));
    }
    SourceExprArgs {
      file: self.file.clone(),
      expr: self.expr.clone(),
      call_package: self.call_package.clone(),
      auto_args,
    }
  }

  /// Files are read from outside any flake, so their evaluation is impure.
  pub fn is_impure(&self) -> bool {
    self.file.is_some() || self.call_package.is_some()
  }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ModifierArgs {
  /// Apply the function EXPR to each installable's value
  #[arg(long, value_name = "EXPR")]
  pub apply: Option<String>,

  /// Override argument NAME with the value of EXPR
  #[arg(long = "override", num_args = 2, value_names = ["NAME", "EXPR"])]
  pub overrides: Vec<String>,

  /// Override argument NAME with the value of a flake installable
  #[arg(long, num_args = 2, value_names = ["NAME", "INSTALLABLE"])]
  pub override_with: Vec<String>,

  /// Override argument NAME with attribute ATTR of the evaluated file
  #[arg(long, num_args = 2, value_names = ["NAME", "ATTR"])]
  pub override_from_file: Vec<String>,

  /// Change derivation attributes; EXPR sees the previous attributes as `old`
  #[arg(long, value_name = "EXPR")]
  pub override_attrs: Option<String>,

  /// Extend an environment with the packages EXPR selects from `ps`
  #[arg(long, value_name = "EXPR")]
  pub with_packages: Option<String>,
}

impl ModifierArgs {
  pub fn to_modifiers(&self) -> Modifiers {
    let mut overrides = BTreeMap::new();
    for (name, expr) in pairs(&self.overrides) {
      overrides.insert(name, OverrideArg::Expr(expr));
    }
    for (name, installable) in pairs(&self.override_with) {
      overrides.insert(name, OverrideArg::Installable(installable));
    }
    for (name, attr) in pairs(&self.override_from_file) {
      overrides.insert(name, OverrideArg::FileAttr(attr));
    }
    Modifiers {
      apply: self.apply.clone(),
      overrides,
      override_attrs: self.override_attrs.clone(),
      with_packages: self.with_packages.clone(),
    }
  }
}

#[derive(Args, Debug, Clone, Default)]
pub struct LockArgs {
  /// Ignore the existing lock file and lock every input from scratch
  #[arg(long)]
  pub recreate_lock_file: bool,

  /// Fail instead of changing the lock file
  #[arg(long)]
  pub no_update_lock_file: bool,

  /// Keep a changed lock in memory only
  #[arg(long)]
  pub no_write_lock_file: bool,

  /// Commit a changed lock file with git
  #[arg(long)]
  pub commit_lock_file: bool,

  /// Do not resolve indirect flake references through the registries
  #[arg(long)]
  pub no_registries: bool,

  /// Replace input INPUT_PATH with FLAKE_REF
  #[arg(long, num_args = 2, value_names = ["INPUT_PATH", "FLAKE_REF"])]
  pub override_input: Vec<String>,

  /// Re-lock INPUT_PATH even if the lock file pins it
  #[arg(long, value_name = "INPUT_PATH")]
  pub update_input: Vec<String>,

  /// Read the existing lock from FILE
  #[arg(long, value_name = "FILE")]
  pub reference_lock_file: Option<PathBuf>,

  /// Write the new lock to FILE
  #[arg(long, value_name = "FILE")]
  pub output_lock_file: Option<PathBuf>,

  /// Resolve flake ID to FLAKE_REF for this command
  #[arg(long, num_args = 2, value_names = ["ID", "FLAKE_REF"])]
  pub override_flake: Vec<String>,

  /// Use the inputs of FLAKE_REF as registry entries
  #[arg(long, value_name = "FLAKE_REF")]
  pub inputs_from: Option<String>,
}

impl LockArgs {
  pub fn to_flags(&self, cwd: &Path) -> Result<LockFlags> {
    let mut flags = LockFlags {
      recreate_lock_file: self.recreate_lock_file,
      update_lock_file: !self.no_update_lock_file,
      write_lock_file: !self.no_write_lock_file,
      commit_lock_file: self.commit_lock_file,
      use_registries: !self.no_registries,
      reference_lock_file_path: self.reference_lock_file.clone(),
      output_lock_file_path: self.output_lock_file.clone(),
      ..LockFlags::default()
    };
    if flags.commit_lock_file && !flags.write_lock_file {
      bail!("'--commit-lock-file' and '--no-write-lock-file' are exclusive");
    }
    for (path, flake_ref) in pairs(&self.override_input) {
      let flake_ref = lib_err(parse_flake_ref(&flake_ref, Some(cwd)))?;
      flags.override_input(InputPath::parse(&path), flake_ref);
    }
    for path in &self.update_input {
      flags.input_updates.insert(InputPath::parse(path));
    }
    Ok(flags)
  }
}

#[derive(Args, Debug, Clone, Default)]
pub struct EvalArgs {
  /// System to evaluate for (defaults to the current one)
  #[arg(long, value_name = "SYSTEM")]
  pub system: Option<String>,

  /// Neither read nor write the evaluation cache
  #[arg(long)]
  pub no_eval_cache: bool,

  /// Let flakes see `builtins.currentSystem`
  #[arg(long)]
  pub impure: bool,
}

impl EvalArgs {
  pub fn to_settings(&self, impure: bool) -> EvalSettings {
    let mut settings = EvalSettings::from_env();
    if let Some(system) = &self.system {
      settings.system = system.clone();
    }
    settings.use_eval_cache = !self.no_eval_cache;
    settings.pure_eval = !(self.impure || impure);
    settings
  }
}

/// `[a, b, c, d]` as `[(a, b), (c, d)]`; clap guarantees an even count.
fn pairs(flat: &[String]) -> Vec<(String, String)> {
  flat
    .chunks_exact(2)
    .map(|pair| (pair[0].clone(), pair[1].clone()))
    .collect()
}
