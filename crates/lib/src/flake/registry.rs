//! The flake registry: maps indirect ids like `nixpkgs` to concrete refs.
//!
//! Lookups consult, in order, the in-process override layer (filled from
//! `--override-flake` and `--inputs-from`) and the user registry at
//! `<config_dir>/registry.json`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FlakeError;
use super::flakeref::{FlakeRef, FlakeSource};
use crate::platform::paths::config_dir;

pub const REGISTRY_VERSION: u32 = 2;

/// Chained lookups stop after this many steps.
const MAX_LOOKUP_DEPTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
  pub from: FlakeRef,
  pub to: FlakeRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
  pub entries: Vec<RegistryEntry>,
}

#[derive(Serialize, Deserialize)]
struct RegistryJson {
  version: u32,
  flakes: Vec<RegistryEntry>,
}

impl Registry {
  pub fn user_path() -> PathBuf {
    config_dir().join("registry.json")
  }

  /// Read a registry file. A missing file is an empty registry.
  pub fn read(path: &Path) -> Result<Self, FlakeError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(source) => return Err(FlakeError::io(path, source)),
    };
    let json: RegistryJson = serde_json::from_str(&content).map_err(|e| FlakeError::Registry {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if json.version != REGISTRY_VERSION {
      return Err(FlakeError::Registry {
        path: path.display().to_string(),
        message: format!("unsupported registry version {}", json.version),
      });
    }
    Ok(Self { entries: json.flakes })
  }

  pub fn add(&mut self, from: FlakeRef, to: FlakeRef) {
    self.entries.retain(|e| e.from != from);
    self.entries.push(RegistryEntry { from, to });
  }

  fn find(&self, input: &FlakeRef) -> Option<FlakeRef> {
    let FlakeSource::Indirect { id, git_ref, rev } = &input.source else {
      return None;
    };
    self.entries.iter().find_map(|entry| {
      let FlakeSource::Indirect {
        id: from_id,
        git_ref: from_ref,
        ..
      } = &entry.from.source
      else {
        return None;
      };
      if from_id != id || (from_ref.is_some() && from_ref != git_ref) {
        return None;
      }
      let mut to = entry.to.clone();
      // Pins on the input win over the registry target.
      match &mut to.source {
        FlakeSource::Git {
          git_ref: to_ref,
          rev: to_rev,
          ..
        }
        | FlakeSource::Indirect {
          git_ref: to_ref,
          rev: to_rev,
          ..
        } => {
          if git_ref.is_some() && from_ref.is_none() {
            *to_ref = git_ref.clone();
          }
          if rev.is_some() {
            *to_rev = rev.clone();
          }
        }
        FlakeSource::Path { .. } => {}
      }
      if input.dir.is_some() {
        to.dir = input.dir.clone();
      }
      Some(to)
    })
  }
}

/// The registries consulted for a command.
#[derive(Debug, Clone)]
pub struct Registries {
  pub overrides: Registry,
  pub user: Registry,
  pub enabled: bool,
}

impl Registries {
  pub fn new(user: Registry) -> Self {
    Self {
      overrides: Registry::default(),
      user,
      enabled: true,
    }
  }

  pub fn load() -> Result<Self, FlakeError> {
    Ok(Self::new(Registry::read(&Registry::user_path())?))
  }

  /// Resolve an indirect reference. Direct references are returned as is.
  pub fn lookup(&self, input: &FlakeRef) -> Result<FlakeRef, FlakeError> {
    let mut current = input.clone();
    for _ in 0..MAX_LOOKUP_DEPTH {
      if !current.is_indirect() {
        if &current != input {
          debug!(from = %input, to = %current, "resolved flake reference through registry");
        }
        return Ok(current);
      }
      // The override layer applies even when registries are disabled.
      let found = match self.overrides.find(&current) {
        Some(found) => Some(found),
        None if self.enabled => self.user.find(&current),
        None => {
          return Err(FlakeError::RegistryDisabled(current.to_string()));
        }
      };
      current = found.ok_or_else(|| FlakeError::NotInRegistry(current.to_string()))?;
    }
    Err(FlakeError::RegistryLoop(input.to_string()))
  }
}
