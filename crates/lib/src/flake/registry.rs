//! The flake registry: symbolic ids to concrete references.
//!
//! # Registry Format
//!
//! ```json
//! {
//!   "version": 2,
//!   "flakes": [
//!     {
//!       "from": { "type": "indirect", "id": "pkgs" },
//!       "to": { "type": "path", "path": "/src/pkgs" }
//!     }
//!   ]
//! }
//! ```

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::lockfile::{InputPath, LockFlags};
use super::{FlakeError, FlakeRef, lock_flake};
use crate::eval::EvalState;

/// Current registry format version.
pub const REGISTRY_VERSION: u32 = 2;

/// Maximum number of indirections followed when resolving a reference.
const MAX_INDIRECTIONS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
  pub from: FlakeRef,
  pub to: FlakeRef,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
  version: u32,
  #[serde(default)]
  flakes: Vec<RegistryEntry>,
}

/// Registry entries in lookup order: overrides first, then the user registry.
///
/// A registry is an ordinary value. Adding an override produces the
/// extended registry; nothing is shared between resolutions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
  overrides: Vec<RegistryEntry>,
  entries: Vec<RegistryEntry>,
}

impl Registry {
  /// Load the user registry. A missing file is an empty registry.
  pub fn load(path: &Path) -> Result<Self, FlakeError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(source) => {
        return Err(FlakeError::RegistryRead {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    let file: RegistryFile = serde_json::from_str(&content).map_err(|source| FlakeError::RegistryParse {
      path: path.to_path_buf(),
      source,
    })?;
    if file.version != REGISTRY_VERSION {
      return Err(FlakeError::UnsupportedRegistryVersion(file.version));
    }

    debug!(path = %path.display(), entries = file.flakes.len(), "loaded flake registry");
    Ok(Self {
      overrides: Vec::new(),
      entries: file.flakes,
    })
  }

  /// Save the user entries (not the overrides).
  pub fn save(&self, path: &Path) -> Result<(), FlakeError> {
    let file = RegistryFile {
      version: REGISTRY_VERSION,
      flakes: self.entries.clone(),
    };
    let content = serde_json::to_string_pretty(&file).map_err(FlakeError::RegistrySerialize)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|source| FlakeError::RegistryWrite {
        path: path.to_path_buf(),
        source,
      })?;
    }
    fs::write(path, content).map_err(|source| FlakeError::RegistryWrite {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Add an entry to the user registry, replacing one with the same `from`.
  pub fn add(&mut self, from: FlakeRef, to: FlakeRef) {
    self.entries.retain(|e| e.from != from);
    self.entries.push(RegistryEntry { from, to });
  }

  /// This registry with `from` overridden to `to`.
  pub fn with_override(mut self, from: FlakeRef, to: FlakeRef) -> Self {
    self.overrides.retain(|e| e.from != from);
    self.overrides.push(RegistryEntry { from, to });
    self
  }

  pub fn lookup(&self, flake_ref: &FlakeRef) -> Option<&FlakeRef> {
    self
      .overrides
      .iter()
      .chain(&self.entries)
      .find(|e| e.from == *flake_ref)
      .map(|e| &e.to)
  }

  /// Follow indirect references until a direct one is reached.
  pub fn resolve(&self, flake_ref: &FlakeRef, use_registries: bool) -> Result<FlakeRef, FlakeError> {
    if !flake_ref.is_indirect() {
      return Ok(flake_ref.clone());
    }
    if !use_registries {
      return Err(FlakeError::RegistriesDisabled {
        flake: flake_ref.to_string(),
      });
    }

    let mut current = flake_ref.clone();
    for _ in 0..MAX_INDIRECTIONS {
      let Some(next) = self.lookup(&current) else {
        return Err(FlakeError::NotInRegistry {
          flake: current.to_string(),
        });
      };
      trace!(from = %current, to = %next, "registry lookup");
      if !next.is_indirect() {
        return Ok(next.clone());
      }
      current = next.clone();
    }

    Err(FlakeError::RegistryLoop {
      flake: flake_ref.to_string(),
    })
  }

  /// This registry extended with every input of the flake `flake_ref`,
  /// each registered under its input name.
  ///
  /// The flake is locked without writing its lock file.
  pub fn apply_inputs_from(self, state: &EvalState, flake_ref: &FlakeRef, flags: &LockFlags) -> Result<Self, FlakeError> {
    let flags = LockFlags {
      write_lock_file: false,
      ..flags.clone()
    };
    let locked = lock_flake(state, flake_ref, &flags, &self)?;

    let mut registry = self;
    for name in locked.flake.inputs.keys() {
      let Some(index) = locked.lock_file.find_input(&InputPath(vec![name.clone()]))? else {
        continue;
      };
      if let Some(node) = locked.lock_file.node(index) {
        debug!(input = %name, to = %node.locked, "registering input as registry override");
        registry = registry.with_override(FlakeRef::Indirect { id: name.clone() }, node.locked.clone());
      }
    }
    Ok(registry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;
  use tempfile::TempDir;

  fn id(s: &str) -> FlakeRef {
    FlakeRef::Indirect { id: s.to_string() }
  }

  fn dir(s: &str) -> FlakeRef {
    FlakeRef::Path { path: PathBuf::from(s) }
  }

  #[test]
  fn direct_references_resolve_to_themselves() {
    let registry = Registry::default();
    assert_eq!(registry.resolve(&dir("/src"), false).unwrap(), dir("/src"));
  }

  #[test]
  fn overrides_take_precedence() {
    let mut registry = Registry::default();
    registry.add(id("pkgs"), dir("/user/pkgs"));
    let registry = registry.with_override(id("pkgs"), dir("/override/pkgs"));

    assert_eq!(registry.resolve(&id("pkgs"), true).unwrap(), dir("/override/pkgs"));
  }

  #[test]
  fn chains_of_ids_are_followed() {
    let registry = Registry::default()
      .with_override(id("a"), id("b"))
      .with_override(id("b"), dir("/src/b"));
    assert_eq!(registry.resolve(&id("a"), true).unwrap(), dir("/src/b"));
  }

  #[test]
  fn loops_are_detected() {
    let registry = Registry::default()
      .with_override(id("a"), id("b"))
      .with_override(id("b"), id("a"));
    assert!(matches!(
      registry.resolve(&id("a"), true).unwrap_err(),
      FlakeError::RegistryLoop { .. }
    ));
  }

  #[test]
  fn unknown_ids_fail() {
    let err = Registry::default().resolve(&id("nope"), true).unwrap_err();
    assert!(matches!(err, FlakeError::NotInRegistry { .. }));
  }

  #[test]
  fn disabled_registries_refuse_indirect_references() {
    let registry = Registry::default().with_override(id("pkgs"), dir("/src"));
    let err = registry.resolve(&id("pkgs"), false).unwrap_err();
    assert!(matches!(err, FlakeError::RegistriesDisabled { .. }));
  }

  #[test]
  fn save_and_load_keep_user_entries_only() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("registry.json");

    let mut registry = Registry::default();
    registry.add(id("pkgs"), dir("/src/pkgs"));
    let registry = registry.with_override(id("tmp"), dir("/tmp"));
    registry.save(&file).unwrap();

    let loaded = Registry::load(&file).unwrap();
    assert_eq!(loaded.lookup(&id("pkgs")), Some(&dir("/src/pkgs")));
    assert_eq!(loaded.lookup(&id("tmp")), None);
  }

  #[test]
  fn missing_registry_is_empty() {
    let temp = TempDir::new().unwrap();
    assert_eq!(Registry::load(&temp.path().join("none.json")).unwrap(), Registry::default());
  }

  #[test]
  fn unsupported_version_is_rejected() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("registry.json");
    fs::write(&file, r#"{"version": 1, "flakes": []}"#).unwrap();
    assert!(matches!(
      Registry::load(&file).unwrap_err(),
      FlakeError::UnsupportedRegistryVersion(1)
    ));
  }
}
