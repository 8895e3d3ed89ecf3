mod args;
mod cmd;
mod output;

use std::fmt::Display;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use realize_lib::store::BuildMode;

use args::{InstallableArgs, LockArgs};
use cmd::{BuildOptions, cmd_build, cmd_complete, cmd_drv_path, cmd_lock, cmd_path};

/// Library errors may carry Lua state, which is neither `Send` nor `Sync`,
/// so they are flattened to their message.
pub fn lib_err<T, E: Display>(result: std::result::Result<T, E>) -> Result<T> {
  result.map_err(|e| anyhow!("{e}"))
}

/// realize - build flake outputs and store paths
#[derive(Parser)]
#[command(name = "realize")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build installables and link their outputs
  Build {
    #[command(flatten)]
    installables: InstallableArgs,

    /// Show what would be built without building
    #[arg(long)]
    dry_run: bool,

    /// Print the built paths as JSON
    #[arg(long)]
    json: bool,

    /// Print the output paths of the built installables
    #[arg(long)]
    print_out_paths: bool,

    /// Do not create out-links
    #[arg(long)]
    no_link: bool,

    /// Base name of the out-links (default: result)
    #[arg(short, long, value_name = "PATH")]
    out_link: Option<PathBuf>,

    /// Rebuild and check that the outputs are unchanged
    #[arg(long, conflicts_with = "repair")]
    rebuild: bool,

    /// Rebuild outputs that already exist, replacing them
    #[arg(long)]
    repair: bool,
  },

  /// Build one installable and print its store path
  Path {
    #[command(flatten)]
    installables: InstallableArgs,

    /// Use this attribute of the installable's value
    #[arg(long, value_name = "ATTR")]
    attr: Option<String>,

    /// Print the derivation instead of building
    #[arg(long)]
    derivation: bool,
  },

  /// Print the derivations that produce installables
  DrvPath {
    #[command(flatten)]
    installables: InstallableArgs,
  },

  /// Create or update a flake's lock file
  Lock {
    /// The flake to lock
    #[arg(default_value = ".")]
    flake: String,

    #[command(flatten)]
    lock: LockArgs,

    /// Print the lock file as JSON
    #[arg(long)]
    json: bool,
  },

  /// Complete a partially typed installable
  #[command(hide = true)]
  Complete { prefix: String },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "info" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build {
      installables,
      dry_run,
      json,
      print_out_paths,
      no_link,
      out_link,
      rebuild,
      repair,
    } => {
      let build_mode = if rebuild {
        BuildMode::Check
      } else if repair {
        BuildMode::Repair
      } else {
        BuildMode::Normal
      };
      let options = BuildOptions {
        dry_run,
        json,
        print_out_paths,
        no_link,
        out_link,
        build_mode,
      };
      cmd_build(&installables, &options)
    }
    Commands::Path {
      installables,
      attr,
      derivation,
    } => cmd_path(&installables, attr.as_deref(), derivation),
    Commands::DrvPath { installables } => cmd_drv_path(&installables),
    Commands::Lock { flake, lock, json } => cmd_lock(&flake, &lock, json),
    Commands::Complete { prefix } => cmd_complete(&prefix),
  }
}
