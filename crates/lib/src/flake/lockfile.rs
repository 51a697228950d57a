//! Flake lock files.
//!
//! The lock file (`flake.lock`) pins every input of a flake to a source
//! directory and content hash. It lives next to `flake.lua`.
//!
//! # Lock File Format
//!
//! ```json
//! {
//!   "version": 7,
//!   "root": "root",
//!   "nodes": {
//!     "root": { "inputs": { "pkgs": "pkgs", "utils": ["pkgs", "utils"] } },
//!     "pkgs": {
//!       "original": { "type": "indirect", "id": "pkgs" },
//!       "locked": { "type": "path", "path": "/src/pkgs" },
//!       "narHash": "sha256:...",
//!       "flake": true
//!     }
//!   }
//! }
//! ```
//!
//! An input is either the key of another node or, for `follows`, the input
//! path it follows, starting at the root.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::FlakeRef;

/// Current lock file format version.
pub const LOCK_VERSION: u32 = 7;

/// Maximum number of `follows` hops when resolving an input path.
pub const MAX_FOLLOWS_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum LockError {
  /// Failed to read the lock file.
  #[error("failed to read lock file: {0}")]
  Read(#[source] io::Error),

  /// Failed to write the lock file.
  #[error("failed to write lock file: {0}")]
  Write(#[source] io::Error),

  /// Failed to parse the lock file JSON.
  #[error("failed to parse lock file: {0}")]
  Parse(#[source] serde_json::Error),

  /// Failed to serialize the lock file.
  #[error("failed to serialize lock file: {0}")]
  Serialize(#[source] serde_json::Error),

  /// Lock file version is not supported.
  #[error("unsupported lock file version {0}, expected {LOCK_VERSION}")]
  UnsupportedVersion(u32),

  /// An input refers to a node that is not in the file.
  #[error("lock file references missing node '{0}'")]
  MissingNode(String),

  #[error("follows chain too deep (maximum {MAX_FOLLOWS_DEPTH} hops) resolving '{0}'")]
  FollowsTooDeep(InputPath),

  #[error("invalid input path '{0}'")]
  InvalidInputPath(String),
}

/// A `/`-separated path of input names, such as `pkgs/utils`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputPath(pub Vec<String>);

impl InputPath {
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// This path extended by one input name.
  pub fn child(&self, name: &str) -> Self {
    let mut path = self.0.clone();
    path.push(name.to_string());
    Self(path)
  }
}

impl FromStr for InputPath {
  type Err = LockError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.is_empty() {
      return Ok(Self::default());
    }
    let components: Vec<String> = s.split('/').map(String::from).collect();
    if components.iter().any(|c| c.is_empty()) {
      return Err(LockError::InvalidInputPath(s.to_string()));
    }
    Ok(Self(components))
  }
}

impl fmt::Display for InputPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.join("/"))
  }
}

/// How `lock_flake` may use and change the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFlags {
  /// Ignore the existing lock file.
  pub recreate_lock_file: bool,
  /// Allow adding or changing entries.
  pub update_lock_file: bool,
  /// Write the lock file back when it changed.
  pub write_lock_file: bool,
  /// Resolve indirect references through the registry.
  pub use_registries: bool,
  pub commit_lock_file: bool,
  /// Inputs to re-lock even if the lock file has them.
  pub input_updates: BTreeSet<InputPath>,
  /// Inputs pinned to a specific reference.
  pub input_overrides: BTreeMap<InputPath, FlakeRef>,
  /// Apply the flake's `config` table.
  pub apply_config: bool,
}

impl Default for LockFlags {
  fn default() -> Self {
    Self {
      recreate_lock_file: false,
      update_lock_file: true,
      write_lock_file: true,
      use_registries: true,
      commit_lock_file: false,
      input_updates: BTreeSet::new(),
      input_overrides: BTreeMap::new(),
      apply_config: false,
    }
  }
}

impl LockFlags {
  /// Pin `input` to `flake_ref`. An overridden lock file is never written.
  pub fn override_input(&mut self, input: InputPath, flake_ref: FlakeRef) {
    self.write_lock_file = false;
    self.input_overrides.insert(input, flake_ref);
  }
}

/// A pinned input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedNode {
  /// The reference as the flake declared it.
  pub original: FlakeRef,
  /// The directory it resolved to.
  pub locked: FlakeRef,
  pub nar_hash: String,
  pub flake: bool,
}

impl LockedNode {
  pub fn source_dir(&self) -> Option<&Path> {
    self.locked.path()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
  Root,
  Locked(LockedNode),
}

/// The lock graph.
///
/// Nodes live in a petgraph arena; an edge `a -> b` labelled `name` means
/// input `name` of `a` is `b`. `follows` inputs are kept apart, keyed by the
/// node declaring them.
#[derive(Debug, Clone)]
pub struct LockFile {
  graph: DiGraph<Node, String>,
  root: NodeIndex,
  follows: BTreeMap<(NodeIndex, String), InputPath>,
}

impl Default for LockFile {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFileJson {
  version: u32,
  root: String,
  nodes: BTreeMap<String, NodeJson>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeJson {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  inputs: BTreeMap<String, InputJson>,
  #[serde(flatten)]
  locked: Option<LockedNode>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum InputJson {
  Node(String),
  Follows(Vec<String>),
}

impl LockFile {
  pub fn new() -> Self {
    let mut graph = DiGraph::new();
    let root = graph.add_node(Node::Root);
    Self {
      graph,
      root,
      follows: BTreeMap::new(),
    }
  }

  pub fn root(&self) -> NodeIndex {
    self.root
  }

  pub fn node(&self, index: NodeIndex) -> Option<&LockedNode> {
    match self.graph.node_weight(index)? {
      Node::Root => None,
      Node::Locked(node) => Some(node),
    }
  }

  /// Add `node` as input `name` of `parent`.
  pub fn add_input(&mut self, parent: NodeIndex, name: &str, node: LockedNode) -> NodeIndex {
    let index = self.graph.add_node(Node::Locked(node));
    self.graph.add_edge(parent, index, name.to_string());
    index
  }

  /// Make input `name` of `parent` follow `target`.
  pub fn add_follows(&mut self, parent: NodeIndex, name: &str, target: InputPath) {
    self.follows.insert((parent, name.to_string()), target);
  }

  /// The direct inputs of `node` that are nodes, by name.
  pub fn inputs(&self, node: NodeIndex) -> BTreeMap<String, NodeIndex> {
    self
      .graph
      .edges(node)
      .map(|edge| (edge.weight().clone(), edge.target()))
      .collect()
  }

  fn child(&self, node: NodeIndex, name: &str) -> Option<NodeIndex> {
    self
      .graph
      .edges(node)
      .find(|edge| edge.weight() == name)
      .map(|edge| edge.target())
  }

  /// Resolve `path` from the root, following `follows` declarations.
  pub fn find_input(&self, path: &InputPath) -> Result<Option<NodeIndex>, LockError> {
    self.find_input_from(path, 0)
  }

  fn find_input_from(&self, path: &InputPath, depth: usize) -> Result<Option<NodeIndex>, LockError> {
    if depth > MAX_FOLLOWS_DEPTH {
      return Err(LockError::FollowsTooDeep(path.clone()));
    }

    let mut node = self.root;
    for name in &path.0 {
      if let Some(next) = self.child(node, name) {
        node = next;
      } else if let Some(target) = self.follows.get(&(node, name.clone())) {
        match self.find_input_from(target, depth + 1)? {
          Some(next) => node = next,
          None => return Ok(None),
        }
      } else {
        return Ok(None);
      }
    }
    Ok(Some(node))
  }

  /// Load a lock file.
  ///
  /// Returns `Ok(None)` if the file doesn't exist.
  pub fn load(path: &Path) -> Result<Option<Self>, LockError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(LockError::Read(e)),
    };
    Self::parse(&content).map(Some)
  }

  pub fn parse(content: &str) -> Result<Self, LockError> {
    let json: LockFileJson = serde_json::from_str(content).map_err(LockError::Parse)?;
    if json.version != LOCK_VERSION {
      return Err(LockError::UnsupportedVersion(json.version));
    }

    let mut lock = Self::new();
    let mut indices = BTreeMap::new();
    indices.insert(json.root.clone(), lock.root);
    for (key, node) in &json.nodes {
      if *key == json.root {
        continue;
      }
      let weight = match &node.locked {
        Some(locked) => Node::Locked(locked.clone()),
        None => Node::Root,
      };
      indices.insert(key.clone(), lock.graph.add_node(weight));
    }

    for (key, node) in &json.nodes {
      let from = indices[key];
      for (name, input) in &node.inputs {
        match input {
          InputJson::Node(target) => {
            let to = *indices.get(target).ok_or_else(|| LockError::MissingNode(target.clone()))?;
            lock.graph.add_edge(from, to, name.clone());
          }
          InputJson::Follows(path) => {
            lock.follows.insert((from, name.clone()), InputPath(path.clone()));
          }
        }
      }
    }

    Ok(lock)
  }

  fn to_json(&self) -> LockFileJson {
    // Keys are the first input name leading to a node, numbered on clashes.
    let mut keys: BTreeMap<NodeIndex, String> = BTreeMap::new();
    keys.insert(self.root, "root".to_string());
    let mut taken: BTreeSet<String> = BTreeSet::from(["root".to_string()]);
    let mut queue = vec![self.root];
    while let Some(node) = queue.pop() {
      for (name, target) in self.inputs(node) {
        if keys.contains_key(&target) {
          continue;
        }
        let mut key = name.clone();
        let mut n = 1;
        while taken.contains(&key) {
          n += 1;
          key = format!("{}_{}", name, n);
        }
        taken.insert(key.clone());
        keys.insert(target, key);
        queue.insert(0, target);
      }
    }

    let mut nodes = BTreeMap::new();
    for (index, key) in &keys {
      let mut inputs: BTreeMap<String, InputJson> = self
        .inputs(*index)
        .into_iter()
        .map(|(name, target)| (name, InputJson::Node(keys[&target].clone())))
        .collect();
      for ((from, name), target) in &self.follows {
        if from == index {
          inputs.insert(name.clone(), InputJson::Follows(target.0.clone()));
        }
      }
      nodes.insert(
        key.clone(),
        NodeJson {
          inputs,
          locked: self.node(*index).cloned(),
        },
      );
    }

    LockFileJson {
      version: LOCK_VERSION,
      root: "root".to_string(),
      nodes,
    }
  }

  /// Canonical pretty-printed JSON.
  pub fn to_json_string(&self) -> Result<String, LockError> {
    serde_json::to_string_pretty(&self.to_json()).map_err(LockError::Serialize)
  }

  /// Save the lock file with pretty-printed JSON.
  pub fn save(&self, path: &Path) -> Result<(), LockError> {
    let mut content = self.to_json_string()?;
    content.push('\n');
    fs::write(path, content).map_err(LockError::Write)
  }

  /// Two lock files are equivalent when they serialize identically.
  pub fn is_equivalent(&self, other: &Self) -> bool {
    match (self.to_json_string(), other.to_json_string()) {
      (Ok(a), Ok(b)) => a == b,
      _ => false,
    }
  }

  /// Every locked input reachable by a plain input path, and every follows
  /// declaration, keyed by input path.
  fn flatten(&self) -> BTreeMap<InputPath, String> {
    let mut entries = BTreeMap::new();
    let mut stack = vec![(self.root, InputPath::default())];
    let mut visited = BTreeSet::new();
    while let Some((node, path)) = stack.pop() {
      if !visited.insert(node) {
        continue;
      }
      for (name, target) in self.inputs(node) {
        let child = path.child(&name);
        if let Some(locked) = self.node(target) {
          entries.insert(child.clone(), format!("'{}' ({})", locked.locked, locked.nar_hash));
        }
        stack.push((target, child));
      }
      for ((from, name), target) in &self.follows {
        if *from == node {
          entries.insert(path.child(name), format!("follows '{}'", target));
        }
      }
    }
    entries
  }

  /// Human-readable changes from `old` to `new`, one line per input.
  pub fn diff(old: &Self, new: &Self) -> Vec<String> {
    let old = old.flatten();
    let new = new.flatten();
    let mut lines = Vec::new();

    for (path, entry) in &new {
      match old.get(path) {
        None => lines.push(format!("• Added input '{}':\n    {}", path, entry)),
        Some(previous) if previous != entry => {
          lines.push(format!("• Updated input '{}':\n    {}\n  → {}", path, previous, entry))
        }
        Some(_) => {}
      }
    }
    for path in old.keys() {
      if !new.contains_key(path) {
        lines.push(format!("• Removed input '{}'", path));
      }
    }
    lines
  }
}

/// Where the lock file of a flake in `dir` lives.
pub fn lock_file_path(dir: &Path) -> PathBuf {
  dir.join(crate::consts::FLAKE_LOCK_FILENAME)
}
