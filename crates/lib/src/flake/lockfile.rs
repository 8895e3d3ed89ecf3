//! The `flake.lock` file.
//!
//! On disk the lock is a flat graph of nodes keyed by id, with `root`
//! naming the top-level node:
//!
//! ```json
//! {
//!   "version": 7,
//!   "root": "root",
//!   "nodes": {
//!     "root": { "inputs": { "lib": "lib" } },
//!     "lib": {
//!       "locked": "path:/src/lib?narHash=...",
//!       "original": "path:./lib",
//!       "inputs": {}
//!     }
//!   }
//! }
//! ```
//!
//! In memory it is a tree of [`LockedNode`]s. Identical subtrees are
//! written once and shared by id.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::flakeref::FlakeRef;

/// Current lock file format version.
pub const LOCK_VERSION: u32 = 7;

const ROOT_ID: &str = "root";

#[derive(Debug, Error)]
pub enum LockFileError {
  #[error("failed to read lock file '{path}': {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock file '{path}': {source}")]
  Write {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse lock file: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("unsupported lock file version {0}, expected {LOCK_VERSION}")]
  UnsupportedVersion(u32),

  #[error("lock file refers to unknown node '{0}'")]
  UnknownNode(String),

  #[error("lock file contains a cycle through node '{0}'")]
  Cycle(String),
}

/// A path of input names from the root, such as `["nixpkgs", "lib"]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InputPath(pub Vec<String>);

impl InputPath {
  pub fn parse(s: &str) -> Self {
    Self(s.split('/').filter(|p| !p.is_empty()).map(str::to_string).collect())
  }

  pub fn child(&self, name: &str) -> Self {
    let mut parts = self.0.clone();
    parts.push(name.to_string());
    Self(parts)
  }

  pub fn is_prefix_of(&self, other: &InputPath) -> bool {
    other.0.starts_with(&self.0)
  }
}

impl fmt::Display for InputPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.join("/"))
  }
}

/// A locked input and, for flake inputs, its own locked inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedNode {
  pub locked: FlakeRef,
  pub original: FlakeRef,
  pub is_flake: bool,
  pub inputs: BTreeMap<String, LockedNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockFile {
  pub inputs: BTreeMap<String, LockedNode>,
}

#[derive(Serialize, Deserialize)]
struct LockFileJson {
  version: u32,
  root: String,
  nodes: BTreeMap<String, NodeJson>,
}

#[derive(Serialize, Deserialize)]
struct NodeJson {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  locked: Option<FlakeRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  original: Option<FlakeRef>,
  #[serde(default = "default_true", skip_serializing_if = "is_true")]
  flake: bool,
  #[serde(default)]
  inputs: BTreeMap<String, String>,
}

fn default_true() -> bool {
  true
}

fn is_true(b: &bool) -> bool {
  *b
}

impl LockFile {
  /// Read the lock file at `path`, returning `None` when it does not exist.
  pub fn read(path: &Path) -> Result<Option<Self>, LockFileError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(LockFileError::Read {
          path: path.display().to_string(),
          source,
        });
      }
    };
    Self::parse(&content).map(Some)
  }

  pub fn parse(content: &str) -> Result<Self, LockFileError> {
    let json: LockFileJson = serde_json::from_str(content).map_err(LockFileError::Parse)?;
    if json.version != LOCK_VERSION {
      return Err(LockFileError::UnsupportedVersion(json.version));
    }
    let root = json
      .nodes
      .get(&json.root)
      .ok_or_else(|| LockFileError::UnknownNode(json.root.clone()))?;
    let mut visiting = vec![json.root.clone()];
    let inputs = read_inputs(&json.nodes, &root.inputs, &mut visiting)?;
    Ok(Self { inputs })
  }

  /// Write the lock file atomically.
  pub fn write(&self, path: &Path) -> Result<(), LockFileError> {
    let write_err = |source| LockFileError::Write {
      path: path.display().to_string(),
      source,
    };
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    io::Write::write_all(&mut tmp, self.to_string().as_bytes()).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
  }

  fn to_json(&self) -> LockFileJson {
    let mut nodes = BTreeMap::new();
    let mut assigned: Vec<(&LockedNode, String)> = Vec::new();
    let inputs = self
      .inputs
      .iter()
      .map(|(name, node)| (name.clone(), write_node(name, node, &mut nodes, &mut assigned)))
      .collect();
    nodes.insert(
      ROOT_ID.to_string(),
      NodeJson {
        locked: None,
        original: None,
        flake: true,
        inputs,
      },
    );
    LockFileJson {
      version: LOCK_VERSION,
      root: ROOT_ID.to_string(),
      nodes,
    }
  }

  /// The first input whose locked reference does not pin its content.
  pub fn find_unlocked(&self) -> Option<InputPath> {
    fn visit(inputs: &BTreeMap<String, LockedNode>, prefix: &InputPath) -> Option<InputPath> {
      for (name, node) in inputs {
        let path = prefix.child(name);
        if !node.locked.is_locked() {
          return Some(path);
        }
        if let Some(found) = visit(&node.inputs, &path) {
          return Some(found);
        }
      }
      None
    }
    visit(&self.inputs, &InputPath::default())
  }

  pub fn get(&self, path: &InputPath) -> Option<&LockedNode> {
    let (first, rest) = path.0.split_first()?;
    let mut node = self.inputs.get(first)?;
    for name in rest {
      node = node.inputs.get(name)?;
    }
    Some(node)
  }

  /// Every node with its input path, parents before children.
  pub fn all_inputs(&self) -> BTreeMap<InputPath, &LockedNode> {
    fn visit<'a>(inputs: &'a BTreeMap<String, LockedNode>, prefix: &InputPath, out: &mut BTreeMap<InputPath, &'a LockedNode>) {
      for (name, node) in inputs {
        let path = prefix.child(name);
        visit(&node.inputs, &path, out);
        out.insert(path, node);
      }
    }
    let mut out = BTreeMap::new();
    visit(&self.inputs, &InputPath::default(), &mut out);
    out
  }

  /// Human-readable changes from `old` to `new`, one entry per input.
  pub fn diff(old: &LockFile, new: &LockFile) -> Vec<String> {
    let old_inputs = old.all_inputs();
    let new_inputs = new.all_inputs();
    let mut changes = Vec::new();

    for (path, node) in &new_inputs {
      match old_inputs.get(path) {
        None => changes.push(format!("Added input '{path}':\n    '{}'", node.locked)),
        Some(prev) if prev.locked != node.locked => changes.push(format!(
          "Updated input '{path}':\n    '{}'\n  → '{}'",
          prev.locked, node.locked
        )),
        Some(_) => {}
      }
    }
    for path in old_inputs.keys() {
      if !new_inputs.contains_key(path) {
        changes.push(format!("Removed input '{path}'"));
      }
    }
    changes
  }
}

impl fmt::Display for LockFile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let json = serde_json::to_string_pretty(&self.to_json()).map_err(|_| fmt::Error)?;
    writeln!(f, "{json}")
  }
}

fn read_inputs(
  nodes: &BTreeMap<String, NodeJson>,
  inputs: &BTreeMap<String, String>,
  visiting: &mut Vec<String>,
) -> Result<BTreeMap<String, LockedNode>, LockFileError> {
  let mut out = BTreeMap::new();
  for (name, id) in inputs {
    if visiting.contains(id) {
      return Err(LockFileError::Cycle(id.clone()));
    }
    let node = nodes.get(id).ok_or_else(|| LockFileError::UnknownNode(id.clone()))?;
    let (Some(locked), Some(original)) = (&node.locked, &node.original) else {
      return Err(LockFileError::UnknownNode(id.clone()));
    };
    visiting.push(id.clone());
    let children = read_inputs(nodes, &node.inputs, visiting)?;
    visiting.pop();
    out.insert(
      name.clone(),
      LockedNode {
        locked: locked.clone(),
        original: original.clone(),
        is_flake: node.flake,
        inputs: children,
      },
    );
  }
  Ok(out)
}

fn write_node<'a>(
  name: &str,
  node: &'a LockedNode,
  nodes: &mut BTreeMap<String, NodeJson>,
  assigned: &mut Vec<(&'a LockedNode, String)>,
) -> String {
  if let Some((_, id)) = assigned.iter().find(|(n, _)| *n == node) {
    return id.clone();
  }

  let inputs = node
    .inputs
    .iter()
    .map(|(child_name, child)| (child_name.clone(), write_node(child_name, child, nodes, assigned)))
    .collect();

  let mut id = name.to_string();
  let mut n = 2;
  while id == ROOT_ID || nodes.contains_key(&id) {
    id = format!("{name}_{n}");
    n += 1;
  }
  nodes.insert(
    id.clone(),
    NodeJson {
      locked: Some(node.locked.clone()),
      original: Some(node.original.clone()),
      flake: node.is_flake,
      inputs,
    },
  );
  assigned.push((node, id.clone()));
  id
}
