//! Flake references.
//!
//! Supported forms:
//!
//! - `path:<path>`, `/abs/path`, `./rel/path`, `~/path`
//! - `git+https://...`, `git+ssh://...`, `git+file:///...`
//! - `flake:<id>`, `<id>`, `<id>/<ref>` (resolved through the registry)
//!
//! Query parameters `dir`, `narHash`, `ref` and `rev` may follow a `?`, and
//! a fragment (attribute path) may follow the first `#`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::paths::home_dir;

static INDIRECT_ID: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?:flake:)?([a-zA-Z][a-zA-Z0-9_-]*)(?:/([a-zA-Z0-9_.-][a-zA-Z0-9_./-]*))?$")
    .expect("indirect flake id pattern is valid")
});

static REV: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]{40}$").expect("rev pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlakeRefError {
  #[error("'{0}' is not a valid flake reference")]
  Invalid(String),

  #[error("unexpected fragment '{fragment}' in flake reference '{url}'")]
  UnexpectedFragment { url: String, fragment: String },

  #[error("unsupported parameter '{param}' in flake reference '{url}'")]
  UnknownParam { url: String, param: String },

  #[error("'{0}' is not a valid commit hash")]
  BadRev(String),
}

/// Where a flake's source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlakeSource {
  Path {
    path: PathBuf,
    /// Content hash of the tree, present once locked.
    nar_hash: Option<String>,
  },
  Git {
    url: String,
    git_ref: Option<String>,
    rev: Option<String>,
  },
  /// A symbolic name looked up in the registry.
  Indirect {
    id: String,
    git_ref: Option<String>,
    rev: Option<String>,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlakeRef {
  pub source: FlakeSource,
  /// Subdirectory of the source tree containing `flake.lua`.
  pub dir: Option<String>,
}

impl FlakeRef {
  pub fn new(source: FlakeSource) -> Self {
    Self { source, dir: None }
  }

  pub fn path(path: impl Into<PathBuf>) -> Self {
    Self::new(FlakeSource::Path {
      path: path.into(),
      nar_hash: None,
    })
  }

  pub fn indirect(id: impl Into<String>) -> Self {
    Self::new(FlakeSource::Indirect {
      id: id.into(),
      git_ref: None,
      rev: None,
    })
  }

  pub fn is_indirect(&self) -> bool {
    matches!(self.source, FlakeSource::Indirect { .. })
  }

  /// A locked reference pins its content exactly.
  pub fn is_locked(&self) -> bool {
    match &self.source {
      FlakeSource::Path { nar_hash, .. } => nar_hash.is_some(),
      FlakeSource::Git { rev, .. } => rev.is_some(),
      FlakeSource::Indirect { .. } => false,
    }
  }

  pub fn is_relative_path(&self) -> bool {
    matches!(&self.source, FlakeSource::Path { path, .. } if path.is_relative())
  }

  /// Resolve a relative path reference against `base`.
  pub fn resolve_relative(&self, base: &Path) -> Self {
    match &self.source {
      FlakeSource::Path { path, nar_hash } if path.is_relative() => Self {
        source: FlakeSource::Path {
          path: normalize(&base.join(path)),
          nar_hash: nar_hash.clone(),
        },
        dir: self.dir.clone(),
      },
      _ => self.clone(),
    }
  }

  /// Copy of this reference without locking information.
  pub fn unlocked(&self) -> Self {
    let source = match &self.source {
      FlakeSource::Path { path, .. } => FlakeSource::Path {
        path: path.clone(),
        nar_hash: None,
      },
      FlakeSource::Git { url, git_ref, .. } => FlakeSource::Git {
        url: url.clone(),
        git_ref: git_ref.clone(),
        rev: None,
      },
      other => other.clone(),
    };
    Self {
      source,
      dir: self.dir.clone(),
    }
  }

  pub fn subdir(&self) -> &str {
    self.dir.as_deref().unwrap_or("")
  }

  fn query(&self) -> BTreeMap<&'static str, String> {
    let mut query = BTreeMap::new();
    if let Some(dir) = &self.dir {
      query.insert("dir", dir.clone());
    }
    match &self.source {
      FlakeSource::Path { nar_hash, .. } => {
        if let Some(hash) = nar_hash {
          query.insert("narHash", hash.clone());
        }
      }
      FlakeSource::Git { git_ref, rev, .. } | FlakeSource::Indirect { git_ref, rev, .. } => {
        if let Some(git_ref) = git_ref {
          query.insert("ref", git_ref.clone());
        }
        if let Some(rev) = rev {
          query.insert("rev", rev.clone());
        }
      }
    }
    query
  }
}

impl fmt::Display for FlakeRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.source {
      FlakeSource::Path { path, .. } => write!(f, "path:{}", path.display())?,
      FlakeSource::Git { url, .. } => write!(f, "git+{url}")?,
      FlakeSource::Indirect { id, .. } => write!(f, "flake:{id}")?,
    }
    let query = self.query();
    if !query.is_empty() {
      let parts: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
      write!(f, "?{}", parts.join("&"))?;
    }
    Ok(())
  }
}

impl TryFrom<String> for FlakeRef {
  type Error = FlakeRefError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    parse_flake_ref(&value, None)
  }
}

impl From<FlakeRef> for String {
  fn from(value: FlakeRef) -> Self {
    value.to_string()
  }
}

/// Parse a flake reference that must not carry a fragment.
pub fn parse_flake_ref(s: &str, base_dir: Option<&Path>) -> Result<FlakeRef, FlakeRefError> {
  let (flake_ref, fragment) = parse_flake_ref_with_fragment(s, base_dir)?;
  if !fragment.is_empty() {
    return Err(FlakeRefError::UnexpectedFragment {
      url: s.to_string(),
      fragment,
    });
  }
  Ok(flake_ref)
}

/// Parse `flakeref[#fragment]`, splitting at the first `#`.
///
/// Relative paths are resolved against `base_dir` when one is given and
/// kept relative otherwise.
pub fn parse_flake_ref_with_fragment(s: &str, base_dir: Option<&Path>) -> Result<(FlakeRef, String), FlakeRefError> {
  let (url, fragment) = match s.split_once('#') {
    Some((url, fragment)) => (url, percent_decode(fragment)),
    None => (s, String::new()),
  };
  let (url, query) = url.split_once('?').unwrap_or((url, ""));

  let mut source = if let Some(rest) = url.strip_prefix("path:") {
    path_source(rest, base_dir)
  } else if let Some(rest) = url.strip_prefix("git+") {
    if !(rest.starts_with("https://") || rest.starts_with("http://") || rest.starts_with("ssh://") || rest.starts_with("file://")) {
      return Err(FlakeRefError::Invalid(s.to_string()));
    }
    FlakeSource::Git {
      url: rest.to_string(),
      git_ref: None,
      rev: None,
    }
  } else if url.starts_with('/') || url.starts_with('.') || url.starts_with('~') {
    path_source(url, base_dir)
  } else if let Some(caps) = INDIRECT_ID.captures(url) {
    FlakeSource::Indirect {
      id: caps[1].to_string(),
      git_ref: caps.get(2).map(|m| m.as_str().to_string()),
      rev: None,
    }
  } else {
    return Err(FlakeRefError::Invalid(s.to_string()));
  };

  let mut dir = None;
  for pair in query.split('&').filter(|p| !p.is_empty()) {
    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
    let value = percent_decode(value);
    match (key, &mut source) {
      ("dir", _) => dir = Some(value).filter(|d| !d.is_empty()),
      ("narHash", FlakeSource::Path { nar_hash, .. }) => *nar_hash = Some(value),
      ("ref", FlakeSource::Git { git_ref, .. } | FlakeSource::Indirect { git_ref, .. }) => *git_ref = Some(value),
      ("rev", FlakeSource::Git { rev, .. } | FlakeSource::Indirect { rev, .. }) => {
        if !REV.is_match(&value) {
          return Err(FlakeRefError::BadRev(value));
        }
        *rev = Some(value);
      }
      _ => {
        return Err(FlakeRefError::UnknownParam {
          url: s.to_string(),
          param: key.to_string(),
        });
      }
    }
  }

  Ok((FlakeRef { source, dir }, fragment))
}

fn path_source(raw: &str, base_dir: Option<&Path>) -> FlakeSource {
  let path = if raw == "~" {
    home_dir()
  } else if let Some(rest) = raw.strip_prefix("~/") {
    home_dir().join(rest)
  } else {
    PathBuf::from(raw)
  };
  let path = match base_dir {
    Some(base) if path.is_relative() => normalize(&base.join(path)),
    _ if path.is_absolute() => normalize(&path),
    _ => path,
  };
  FlakeSource::Path { path, nar_hash: None }
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
  use std::path::Component;
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}

fn percent_decode(s: &str) -> String {
  let bytes = s.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' && i + 2 < bytes.len() {
      let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
        .ok()
        .and_then(|hex| u8::from_str_radix(hex, 16).ok());
      if let Some(byte) = decoded {
        out.push(byte);
        i += 3;
        continue;
      }
    }
    out.push(bytes[i]);
    i += 1;
  }
  String::from_utf8_lossy(&out).into_owned()
}
