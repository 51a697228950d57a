//! Build requests and their realised counterparts.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::store::{StoreDir, StorePath};

/// A unit of work submitted to the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DerivedPath {
  /// This exact store object, no output selection.
  Opaque { path: StorePath },
  /// The named outputs of a derivation. `outputs` is never empty.
  #[serde(rename_all = "camelCase")]
  Built {
    drv_path: StorePath,
    outputs: BTreeSet<String>,
  },
}

impl DerivedPath {
  /// `<path>` for opaque paths, `<drv>!<out1>,<out2>` for built ones.
  pub fn print(&self, store_dir: &StoreDir) -> String {
    match self {
      Self::Opaque { path } => store_dir.print(path),
      Self::Built { drv_path, outputs } => {
        let outputs: Vec<&str> = outputs.iter().map(String::as_str).collect();
        format!("{}!{}", store_dir.print(drv_path), outputs.join(","))
      }
    }
  }
}

/// A request after realisation, with concrete output paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltPath {
  Opaque {
    path: StorePath,
  },
  Built {
    drv_path: StorePath,
    outputs: BTreeMap<String, StorePath>,
  },
}

impl BuiltPath {
  /// Every concrete path this result refers to.
  pub fn out_paths(&self) -> BTreeSet<StorePath> {
    match self {
      Self::Opaque { path } => BTreeSet::from([path.clone()]),
      Self::Built { outputs, .. } => outputs.values().cloned().collect(),
    }
  }

  pub fn to_json(&self, store_dir: &StoreDir) -> serde_json::Value {
    match self {
      Self::Opaque { path } => serde_json::json!({ "path": store_dir.print(path) }),
      Self::Built { drv_path, outputs } => {
        let outputs: BTreeMap<&str, String> = outputs
          .iter()
          .map(|(name, path)| (name.as_str(), store_dir.print(path)))
          .collect();
        serde_json::json!({ "drvPath": store_dir.print(drv_path), "outputs": outputs })
      }
    }
  }
}

/// How far the orchestrator goes with a set of requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealiseMode {
  /// Put the store in read-only mode and only report what is missing.
  DryRun,
  /// Report what is missing without building anything.
  DerivationOnly,
  /// Build everything that is missing.
  FullOutputs,
}

/// Whether callers want outputs or the derivations producing them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperateOn {
  #[default]
  Output,
  Derivation,
}

/// A derivation-like value found during evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationInfo {
  pub drv_path: StorePath,
  /// Known up front for input-addressed outputs only.
  pub out_path: Option<StorePath>,
  pub output_name: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn path(name: &str) -> StorePath {
    StorePath::from_base_name(&format!("{}-{}", "a".repeat(32), name)).unwrap()
  }

  #[test]
  fn built_paths_print_outputs() {
    let dir = StoreDir::new("/s");
    let built = DerivedPath::Built {
      drv_path: path("hello.drv"),
      outputs: BTreeSet::from(["out".to_string(), "dev".to_string()]),
    };
    assert_eq!(built.print(&dir), format!("/s/{}-hello.drv!dev,out", "a".repeat(32)));
  }

  #[test]
  fn requests_serialize_tagged() {
    let opaque = DerivedPath::Opaque { path: path("src") };
    let json = serde_json::to_value(&opaque).unwrap();
    assert_eq!(json["type"], "opaque");
    assert_eq!(serde_json::from_value::<DerivedPath>(json).unwrap(), opaque);
  }

  #[test]
  fn out_paths_collapse_duplicates() {
    let built = BuiltPath::Built {
      drv_path: path("hello.drv"),
      outputs: BTreeMap::from([("out".to_string(), path("hello")), ("bin".to_string(), path("hello"))]),
    };
    assert_eq!(built.out_paths().len(), 1);
  }
}
