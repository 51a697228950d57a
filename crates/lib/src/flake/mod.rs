//! Flakes: `flake.lua` files with declared inputs and an `outputs` function.
//!
//! ```lua
//! return {
//!   description = "hello",
//!   inputs = {
//!     pkgs = "pkgs",                                -- registry id
//!     utils = { url = "path:../utils" },
//!     data = { url = "path:./data", flake = false },
//!     lib = { follows = "pkgs/lib" },
//!   },
//!   config = { ["extra-substituters"] = "..." },
//!   outputs = function(inputs)
//!     return { packages = { ["x86_64-linux"] = { default = ... } } }
//!   end,
//! }
//! ```
//!
//! Locking is shallow: a flake's lock file pins its own inputs. Inputs that
//! are flakes themselves are called with their own lock files.

mod flakeref;
pub mod lockfile;
pub mod registry;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use mlua::prelude::*;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use flakeref::{FlakeRef, FlakeRefError, parse_flake_ref_with_fragment};
pub use lockfile::{InputPath, LockError, LockFile, LockFlags, LockedNode, lock_file_path};
pub use registry::Registry;

use crate::consts::{FLAKE_FILENAME, FLAKE_LOCK_FILENAME};
use crate::eval::{EvalError, EvalState, Value, lua};
use crate::util::hash::{HashError, hash_bytes, hash_directory};

/// Flake inputs nested deeper than this are rejected.
const MAX_INPUT_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum FlakeError {
  #[error(transparent)]
  FlakeRef(#[from] FlakeRefError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("failed to hash flake source: {0}")]
  Hash(#[from] HashError),

  #[error("error evaluating flake '{flake}': {source}")]
  Eval {
    flake: String,
    #[source]
    source: EvalError,
  },

  #[error("flake '{flake}' is invalid: {message}")]
  Invalid { flake: String, message: String },

  #[error("source tree '{}' does not contain a '{FLAKE_FILENAME}' file", path.display())]
  NoFlakeFile { path: PathBuf },

  #[error("'{flake}' is an indirect flake reference, but registry lookups are not allowed")]
  RegistriesDisabled { flake: String },

  #[error("cannot find flake '{flake}' in the flake registries")]
  NotInRegistry { flake: String },

  #[error("flake registry entries for '{flake}' form a loop")]
  RegistryLoop { flake: String },

  #[error("failed to read registry {}: {source}", path.display())]
  RegistryRead {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write registry {}: {source}", path.display())]
  RegistryWrite {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse registry {}: {source}", path.display())]
  RegistryParse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize registry: {0}")]
  RegistrySerialize(#[source] serde_json::Error),

  #[error("unsupported registry version {0}")]
  UnsupportedRegistryVersion(u32),

  #[error("flake '{flake}' requires lock file changes but they're not allowed due to '--no-update-lock-file'")]
  LockChangesNotAllowed { flake: String },
}

/// Where an input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
  Ref(FlakeRef),
  /// Use whatever another input path resolves to.
  Follows(InputPath),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeInput {
  pub source: InputSource,
  /// False for plain source trees.
  pub is_flake: bool,
}

/// Settings a flake asks for in its `config` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlakeConfig(pub BTreeMap<String, String>);

impl FlakeConfig {
  /// Flake-provided settings are untrusted and never change the running
  /// configuration. Each one is reported and its name returned.
  pub fn apply(&self) -> Vec<String> {
    for (name, value) in &self.0 {
      warn!(setting = %name, value = %value, "ignoring untrusted flake configuration setting");
    }
    self.0.keys().cloned().collect()
  }
}

pub struct Flake {
  /// The reference as given.
  pub original_ref: FlakeRef,
  /// The reference after registry resolution.
  pub resolved_ref: FlakeRef,
  pub source_dir: PathBuf,
  pub description: Option<String>,
  pub inputs: BTreeMap<String, FlakeInput>,
  pub config: FlakeConfig,
  outputs: LuaFunction,
}

impl std::fmt::Debug for Flake {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Flake")
      .field("original_ref", &self.original_ref)
      .field("source_dir", &self.source_dir)
      .field("description", &self.description)
      .field("inputs", &self.inputs)
      .finish()
  }
}

/// A flake together with the lock file its inputs were pinned by.
#[derive(Debug)]
pub struct LockedFlake {
  pub flake: Flake,
  pub lock_file: LockFile,
  /// Hash of the source tree and lock file; keys the evaluation cache.
  pub fingerprint: String,
}

/// Read the flake at `resolved_ref`, which must be a path reference.
pub fn get_flake(state: &EvalState, original_ref: &FlakeRef, resolved_ref: &FlakeRef) -> Result<Flake, FlakeError> {
  let flake_name = original_ref.to_string();
  let Some(source_dir) = resolved_ref.path() else {
    return Err(FlakeError::NotInRegistry { flake: flake_name });
  };
  let file = source_dir.join(FLAKE_FILENAME);
  if !file.is_file() {
    return Err(FlakeError::NoFlakeFile {
      path: source_dir.to_path_buf(),
    });
  }

  debug!(flake = %flake_name, path = %file.display(), "reading flake");
  let eval_err = |source: EvalError| FlakeError::Eval {
    flake: flake_name.clone(),
    source,
  };
  let invalid = |message: String| FlakeError::Invalid {
    flake: flake_name.clone(),
    message,
  };

  let LuaValue::Table(table) = lua::load_file_with_dir(state.lua(), &file).map_err(eval_err)? else {
    return Err(invalid("flake must return a table".to_string()));
  };

  let description: Option<String> = table.get("description").map_err(|e| eval_err(e.into()))?;

  let inputs = match table.get::<LuaValue>("inputs").map_err(|e| eval_err(e.into()))? {
    LuaValue::Nil => BTreeMap::new(),
    LuaValue::Table(inputs) => parse_inputs(&inputs, source_dir).map_err(invalid)?,
    _ => return Err(invalid("inputs must be a table".to_string())),
  };

  let config = match table.get::<LuaValue>("config").map_err(|e| eval_err(e.into()))? {
    LuaValue::Nil => FlakeConfig::default(),
    LuaValue::Table(config) => parse_config(&config).map_err(invalid)?,
    _ => return Err(invalid("config must be a table".to_string())),
  };

  let LuaValue::Function(outputs) = table.get::<LuaValue>("outputs").map_err(|e| eval_err(e.into()))? else {
    return Err(invalid("flake does not have an 'outputs' function".to_string()));
  };

  Ok(Flake {
    original_ref: original_ref.clone(),
    resolved_ref: resolved_ref.clone(),
    source_dir: source_dir.to_path_buf(),
    description,
    inputs,
    config,
    outputs,
  })
}

fn parse_inputs(table: &LuaTable, source_dir: &Path) -> Result<BTreeMap<String, FlakeInput>, String> {
  let mut inputs = BTreeMap::new();

  for pair in table.pairs::<String, LuaValue>() {
    let (name, value) = pair.map_err(|e| e.to_string())?;
    let parse_ref = |url: &str| FlakeRef::parse(url, source_dir).map_err(|e| format!("input '{}': {}", name, e));

    let input = match value {
      LuaValue::String(url) => FlakeInput {
        source: InputSource::Ref(parse_ref(&url.to_string_lossy())?),
        is_flake: true,
      },
      LuaValue::Table(decl) => {
        let url: Option<String> = decl.get("url").map_err(|e| e.to_string())?;
        let follows: Option<String> = decl.get("follows").map_err(|e| e.to_string())?;
        let is_flake: Option<bool> = decl.get("flake").map_err(|e| e.to_string())?;

        let source = match (url, follows) {
          (Some(url), None) => InputSource::Ref(parse_ref(&url)?),
          (None, Some(follows)) => InputSource::Follows(follows.parse().map_err(|e: LockError| e.to_string())?),
          (Some(_), Some(_)) => return Err(format!("input '{}' has both 'url' and 'follows'", name)),
          (None, None) => return Err(format!("input '{}' must have either 'url' or 'follows'", name)),
        };
        FlakeInput {
          source,
          is_flake: is_flake.unwrap_or(true),
        }
      }
      _ => return Err(format!("input '{}' must be a string URL or a table", name)),
    };

    inputs.insert(name, input);
  }

  Ok(inputs)
}

fn parse_config(table: &LuaTable) -> Result<FlakeConfig, String> {
  let mut config = BTreeMap::new();
  for pair in table.pairs::<String, LuaValue>() {
    let (name, value) = pair.map_err(|e| e.to_string())?;
    let value = match value {
      LuaValue::String(s) => s.to_string_lossy().to_string(),
      LuaValue::Boolean(b) => b.to_string(),
      LuaValue::Integer(i) => i.to_string(),
      LuaValue::Number(n) => n.to_string(),
      _ => return Err(format!("config setting '{}' must be a string, number or boolean", name)),
    };
    config.insert(name, value);
  }
  Ok(FlakeConfig(config))
}

/// Pin a declared input to its current source tree.
fn lock_input(registry: &Registry, flags: &LockFlags, original: &FlakeRef, is_flake: bool) -> Result<LockedNode, FlakeError> {
  let locked = registry.resolve(original, flags.use_registries)?;
  let Some(dir) = locked.path() else {
    return Err(FlakeError::NotInRegistry {
      flake: original.to_string(),
    });
  };
  if is_flake && !dir.join(FLAKE_FILENAME).is_file() {
    return Err(FlakeError::NoFlakeFile { path: dir.to_path_buf() });
  }

  let nar_hash = hash_directory(dir, &[".git"])?;
  debug!(input = %original, path = %dir.display(), hash = %nar_hash, "locked input");
  Ok(LockedNode {
    original: original.clone(),
    locked: locked.clone(),
    nar_hash: nar_hash.to_string(),
    flake: is_flake,
  })
}

/// Lock the inputs of `top_ref`, reusing, updating and writing its lock file
/// as `flags` allow.
pub fn lock_flake(
  state: &EvalState,
  top_ref: &FlakeRef,
  flags: &LockFlags,
  registry: &Registry,
) -> Result<LockedFlake, FlakeError> {
  let resolved = registry.resolve(top_ref, flags.use_registries)?;
  let flake = get_flake(state, top_ref, &resolved)?;
  let lock_path = lock_file_path(&flake.source_dir);

  let old = if flags.recreate_lock_file {
    LockFile::new()
  } else {
    LockFile::load(&lock_path)?.unwrap_or_default()
  };

  let is_top_level_input = |path: &InputPath| path.0.len() == 1 && flake.inputs.contains_key(&path.0[0]);
  for path in &flags.input_updates {
    if !is_top_level_input(path) {
      warn!(input = %path, "the flag '--update-input' does not match any input");
    }
  }
  for path in flags.input_overrides.keys() {
    if !is_top_level_input(path) {
      warn!(input = %path, "the flag '--override-input' does not match any input");
    }
  }

  let mut new = LockFile::new();
  let root = new.root();
  for (name, input) in &flake.inputs {
    let path = InputPath(vec![name.clone()]);

    if let Some(pinned) = flags.input_overrides.get(&path) {
      trace!(input = %path, to = %pinned, "overriding input");
      new.add_input(root, name, lock_input(registry, flags, pinned, input.is_flake)?);
      continue;
    }

    match &input.source {
      InputSource::Follows(target) => new.add_follows(root, name, target.clone()),
      InputSource::Ref(declared) => {
        let previous = old
          .find_input(&path)?
          .and_then(|index| old.node(index))
          .filter(|node| node.original == *declared && !flags.input_updates.contains(&path));
        let node = match previous {
          Some(node) => {
            trace!(input = %path, "keeping locked input");
            node.clone()
          }
          None => lock_input(registry, flags, declared, input.is_flake)?,
        };
        new.add_input(root, name, node);
      }
    }
  }

  if !new.is_equivalent(&old) {
    let changes = LockFile::diff(&old, &new).join("\n");
    if flags.write_lock_file {
      if !flags.update_lock_file {
        return Err(FlakeError::LockChangesNotAllowed {
          flake: top_ref.to_string(),
        });
      }
      new.save(&lock_path)?;
      info!(flake = %top_ref, changes = %changes, "updated lock file");
      if flags.commit_lock_file {
        warn!(flake = %top_ref, "cannot commit lock file: the flake is not in a version-controlled tree");
      }
    } else {
      warn!(flake = %top_ref, changes = %changes, "not writing modified lock file");
    }
  }

  if flags.apply_config {
    flake.config.apply();
  }

  let source_hash = hash_directory(&flake.source_dir, &[".git", FLAKE_LOCK_FILENAME])?;
  let fingerprint = hash_bytes(format!("{};{}", source_hash, new.to_json_string()?).as_bytes()).0;
  debug!(flake = %top_ref, fingerprint = %fingerprint, "locked flake");

  Ok(LockedFlake {
    flake,
    lock_file: new,
    fingerprint,
  })
}

/// Call the flake's `outputs` with its locked inputs.
///
/// The result is the flake itself: its outputs plus `outPath`, `inputs`,
/// `outputs` and `_type = "flake"`. It is also what `inputs.self` refers
/// to.
pub fn call_flake(state: &EvalState, locked: &LockedFlake) -> Result<Value, EvalError> {
  let mut called = BTreeMap::new();
  let table = call_flake_table(state, &locked.flake, &locked.lock_file, &mut called, 0)?;
  state.from_lua(LuaValue::Table(table))
}

fn call_flake_table(
  state: &EvalState,
  flake: &Flake,
  lock_file: &LockFile,
  called: &mut BTreeMap<PathBuf, LuaTable>,
  depth: usize,
) -> Result<LuaTable, EvalError> {
  let call_err = |message: String| EvalError::CallFlake {
    flake: flake.original_ref.to_string(),
    message,
  };
  if depth > MAX_INPUT_DEPTH {
    return Err(call_err("flake inputs are nested too deeply".to_string()));
  }

  let lua = state.lua();
  let this = lua.create_table()?;
  called.insert(flake.source_dir.clone(), this.clone());

  let inputs = lua.create_table()?;
  for name in flake.inputs.keys() {
    let index = lock_file
      .find_input(&InputPath(vec![name.clone()]))
      .map_err(|e| call_err(e.to_string()))?;
    let Some(node) = index.and_then(|index| lock_file.node(index)) else {
      return Err(call_err(format!("input '{}' is not locked", name)));
    };
    let Some(dir) = node.source_dir() else {
      return Err(call_err(format!("input '{}' is not locked to a path", name)));
    };

    let value = if !node.flake {
      let tree = lua.create_table()?;
      tree.set("outPath", dir.display().to_string())?;
      tree.set("narHash", node.nar_hash.as_str())?;
      tree
    } else if let Some(existing) = called.get(dir) {
      existing.clone()
    } else {
      trace!(input = %name, path = %dir.display(), "calling input flake");
      let child = get_flake(state, &node.original, &node.locked).map_err(|e| call_err(e.to_string()))?;
      let child_lock = LockFile::load(&lock_file_path(dir))
        .map_err(|e| call_err(e.to_string()))?
        .unwrap_or_default();
      call_flake_table(state, &child, &child_lock, called, depth + 1)?
    };
    inputs.set(name.as_str(), value)?;
  }
  inputs.set("self", this.clone())?;

  let LuaValue::Table(outputs) = flake.outputs.call::<LuaValue>(inputs.clone())? else {
    return Err(call_err("'outputs' must return a table".to_string()));
  };
  for pair in outputs.pairs::<LuaValue, LuaValue>() {
    let (name, value) = pair?;
    this.set(name, value)?;
  }
  this.set("outPath", flake.source_dir.display().to_string())?;
  this.set("inputs", inputs)?;
  this.set("outputs", outputs)?;
  this.set("_type", "flake")?;
  if let Some(description) = &flake.description {
    this.set("description", description.as_str())?;
  }

  Ok(this)
}
