//! Fetching flake sources.
//!
//! - Path sources are used in place; their lock is the content hash of the
//!   tree (excluding `.git`).
//! - Git sources are cloned into `<cache_dir>/git/<hash of url>/` with their
//!   `.git` directory intact so later fetches are incremental, and the locked
//!   revision is checked out into `<cache_dir>/checkouts/<rev>/`. Cloning
//!   and fetching use gix; checkouts and lock file commits run `git`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use gix::remote::Direction;
use thiserror::Error;
use tracing::{debug, info};

use super::flakeref::{FlakeRef, FlakeSource};
use crate::util::hash::{ObjectHash, TreeHashError, hash_path};

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("failed to create cache directory '{0}': {1}")]
  CreateCacheDir(PathBuf, #[source] std::io::Error),

  #[error("failed to clone repository '{url}': {source}")]
  Clone {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to open repository at '{path}': {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: Box<gix::open::Error>,
  },

  #[error("failed to fetch from '{url}': {source}")]
  Fetch {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("revision '{rev}' not found in repository")]
  RevisionNotFound { rev: String },

  #[error("failed to check out revision '{rev}': {message}")]
  Checkout { rev: String, message: String },

  #[error("failed to resolve HEAD: {0}")]
  ResolveHead(String),

  #[error("path does not exist: {0}")]
  PathNotFound(PathBuf),

  #[error("failed to resolve path '{path}': {source}")]
  CanonicalizePath {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("no remote configured for repository")]
  NoRemote,

  #[error("failed to connect to remote '{url}': {source}")]
  Connect {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to hash '{path}': {source}")]
  Hash {
    path: PathBuf,
    #[source]
    source: TreeHashError,
  },

  #[error("NAR hash mismatch in '{path}': expected '{expected}', got '{actual}'")]
  HashMismatch {
    path: PathBuf,
    expected: String,
    actual: String,
  },

  #[error("cannot fetch indirect flake reference '{0}'")]
  Indirect(String),

  #[error("git {command} failed: {message}")]
  Git { command: String, message: String },
}

/// A source tree on disk together with its locked reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
  /// Root of the source tree (before applying `dir`).
  pub path: PathBuf,
  pub locked: FlakeRef,
  /// Identifies the exact source content.
  pub fingerprint: String,
}

/// Fetch a direct flake reference.
pub fn fetch(flake_ref: &FlakeRef, cache_dir: &Path) -> Result<FetchedSource, FetchError> {
  let (path, source, fingerprint) = match &flake_ref.source {
    FlakeSource::Path { path, nar_hash } => {
      let path = resolve_path(path)?;
      let hash = hash_path(&path, &[".git"])
        .map_err(|source| FetchError::Hash {
          path: path.clone(),
          source,
        })?
        .0;
      if let Some(expected) = nar_hash
        && *expected != hash
      {
        return Err(FetchError::HashMismatch {
          path,
          expected: expected.clone(),
          actual: hash,
        });
      }
      let source = FlakeSource::Path {
        path: path.clone(),
        nar_hash: Some(hash.clone()),
      };
      (path, source, hash)
    }
    FlakeSource::Git { url, git_ref, rev } => {
      let repo_dir = cache_dir.join("git").join(ObjectHash::of_str(url).0);
      let rev = fetch_git(url, git_ref.as_deref(), rev.as_deref(), &repo_dir)?;
      let path = checkout(&repo_dir, &rev, &cache_dir.join("checkouts"))?;
      let source = FlakeSource::Git {
        url: url.clone(),
        git_ref: git_ref.clone(),
        rev: Some(rev.clone()),
      };
      (path, source, rev)
    }
    FlakeSource::Indirect { .. } => return Err(FetchError::Indirect(flake_ref.to_string())),
  };

  Ok(FetchedSource {
    path,
    locked: FlakeRef {
      source,
      dir: flake_ref.dir.clone(),
    },
    fingerprint,
  })
}

/// Clone or update the repository at `repo_path` and resolve the revision
/// to lock. A revision already present locally needs no network access.
pub fn fetch_git(url: &str, git_ref: Option<&str>, rev: Option<&str>, repo_path: &Path) -> Result<String, FetchError> {
  if let Some(parent) = repo_path.parent()
    && !parent.exists()
  {
    fs::create_dir_all(parent).map_err(|e| FetchError::CreateCacheDir(parent.to_path_buf(), e))?;
  }

  let repo = if repo_path.join(".git").exists() {
    debug!(url, path = %repo_path.display(), "opening cached repository");
    let repo = gix::open(repo_path).map_err(|e| FetchError::Open {
      path: repo_path.to_path_buf(),
      source: Box::new(e),
    })?;
    let have_rev = rev.is_some_and(|rev| resolve_revision(&repo, None, Some(rev)).is_ok());
    if !have_rev {
      fetch_updates(&repo, url)?;
    }
    repo
  } else {
    info!(url, path = %repo_path.display(), "cloning repository");
    clone_repo(url, repo_path)?
  };

  let commit = resolve_revision(&repo, git_ref, rev)?;
  debug!(url, rev = %commit, "resolved revision");
  Ok(commit)
}

fn clone_repo(url: &str, dest: &Path) -> Result<gix::Repository, FetchError> {
  let mut prepared = gix::prepare_clone(url, dest).map_err(|e| FetchError::Clone {
    url: url.to_string(),
    source: Box::new(e),
  })?;

  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| FetchError::Clone {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  let (repo, _outcome) = checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| FetchError::Checkout {
      rev: "HEAD".to_string(),
      message: e.to_string(),
    })?;

  Ok(repo)
}

fn fetch_updates(repo: &gix::Repository, url: &str) -> Result<(), FetchError> {
  debug!(url, "fetching updates");

  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or(FetchError::NoRemote)?
    .map_err(|e| FetchError::Connect {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  let connection = remote.connect(Direction::Fetch).map_err(|e| FetchError::Connect {
    url: url.to_string(),
    source: Box::new(e),
  })?;

  connection
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| FetchError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| FetchError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  Ok(())
}

/// Resolve to a commit hash: `rev` if given, else the remote branch or tag
/// named `git_ref`, else the remote's HEAD.
fn resolve_revision(repo: &gix::Repository, git_ref: Option<&str>, rev: Option<&str>) -> Result<String, FetchError> {
  let candidates: Vec<String> = match (rev, git_ref) {
    (Some(rev), _) => vec![rev.to_string()],
    (None, Some(git_ref)) => vec![
      format!("refs/remotes/origin/{git_ref}"),
      format!("refs/tags/{git_ref}"),
      git_ref.to_string(),
    ],
    (None, None) => vec!["refs/remotes/origin/HEAD".to_string()],
  };

  for spec in &candidates {
    let Ok(parsed) = repo.rev_parse(spec.as_str()) else {
      continue;
    };
    let Some(id) = parsed.single() else {
      continue;
    };
    let commit = id
      .object()
      .ok()
      .and_then(|object| object.peel_to_commit().ok())
      .map(|commit| commit.id.to_string());
    if let Some(commit) = commit {
      return Ok(commit);
    }
  }

  match (rev, git_ref) {
    (None, None) => {
      let mut head = repo.head().map_err(|e| FetchError::ResolveHead(e.to_string()))?;
      let commit = head
        .peel_to_commit()
        .map_err(|e| FetchError::ResolveHead(e.to_string()))?;
      Ok(commit.id.to_string())
    }
    (rev, git_ref) => Err(FetchError::RevisionNotFound {
      rev: rev.or(git_ref).unwrap_or("HEAD").to_string(),
    }),
  }
}

/// Materialize `rev` under `checkouts_dir`, reusing an earlier checkout.
fn checkout(repo_path: &Path, rev: &str, checkouts_dir: &Path) -> Result<PathBuf, FetchError> {
  let dest = checkouts_dir.join(rev);
  if dest.exists() {
    return Ok(dest);
  }
  fs::create_dir_all(checkouts_dir).map_err(|e| FetchError::CreateCacheDir(checkouts_dir.to_path_buf(), e))?;

  let staging = tempfile::TempDir::new_in(checkouts_dir).map_err(|e| FetchError::Checkout {
    rev: rev.to_string(),
    message: e.to_string(),
  })?;
  run_git(
    repo_path,
    &[
      "--work-tree",
      &staging.path().to_string_lossy(),
      "checkout",
      rev,
      "--",
      ".",
    ],
  )
  .map_err(|e| FetchError::Checkout {
    rev: rev.to_string(),
    message: e.to_string(),
  })?;

  let staged = staging.keep();
  fs::rename(&staged, &dest).map_err(|e| FetchError::Checkout {
    rev: rev.to_string(),
    message: e.to_string(),
  })?;
  debug!(rev, path = %dest.display(), "checked out revision");
  Ok(dest)
}

/// Commit `file` in the repository containing `dir`.
pub fn commit_file(dir: &Path, file: &Path, message: &str) -> Result<(), FetchError> {
  let file = file.to_string_lossy();
  run_git(dir, &["add", "--", &file])?;
  run_git(dir, &["commit", "-m", message, "--", &file])?;
  info!(file = %file, "committed lock file");
  Ok(())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String, FetchError> {
  let output = Command::new("git")
    .arg("-C")
    .arg(dir)
    .args(args)
    .output()
    .map_err(|e| FetchError::Git {
      command: args.first().copied().unwrap_or_default().to_string(),
      message: e.to_string(),
    })?;
  if !output.status.success() {
    return Err(FetchError::Git {
      command: args.first().copied().unwrap_or_default().to_string(),
      message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Canonicalize a path source and check that it exists.
pub fn resolve_path(path: &Path) -> Result<PathBuf, FetchError> {
  let canonical = dunce::canonicalize(path).map_err(|e| {
    if e.kind() == std::io::ErrorKind::NotFound {
      FetchError::PathNotFound(path.to_path_buf())
    } else {
      FetchError::CanonicalizePath {
        path: path.to_path_buf(),
        source: e,
      }
    }
  })?;
  debug!(path = %canonical.display(), "resolved path source");
  Ok(canonical)
}
