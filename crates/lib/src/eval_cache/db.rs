//! Persistent attribute database, one JSON file per fingerprint.
//!
//! ```json
//! {
//!   "version": 1,
//!   "fingerprint": "3f2a...",
//!   "entries": [
//!     { "path": [], "value": { "type": "attrs", "value": ["packages"] } },
//!     { "path": ["packages", "x86_64-linux", "hello", "type"], "value": { "type": "string", "value": "derivation" } }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::EvalCacheError;
use crate::consts::EVAL_CACHE_DIR;
use crate::eval::Value;

/// Current database format version.
pub const DB_VERSION: u32 = 1;

/// What is known about one attribute without evaluating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum AttrValue {
  /// An attribute set; the full list of its names.
  Attrs(Vec<String>),
  String(String),
  Bool(bool),
  Int(i64),
  /// Evaluated to something not worth caching, such as a function.
  Misc,
  /// Evaluation failed; the error is reproduced by evaluating again.
  Failed,
}

impl AttrValue {
  /// Summarise a forced value.
  pub fn from_value(value: &Value) -> Self {
    match value {
      Value::Attrs(attrs) => Self::Attrs(attrs.keys().cloned().collect()),
      Value::String(s) => Self::String(s.to_string()),
      Value::Bool(b) => Self::Bool(*b),
      Value::Int(i) => Self::Int(*i),
      _ => Self::Misc,
    }
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Self::Attrs(_) => "a set",
      Self::String(_) => "a string",
      Self::Bool(_) => "a Boolean",
      Self::Int(_) => "an integer",
      Self::Misc => "a value of another type",
      Self::Failed => "a failed evaluation",
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct DbFile {
  version: u32,
  fingerprint: String,
  entries: Vec<DbEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DbEntry {
  path: Vec<String>,
  value: AttrValue,
}

#[derive(Debug)]
pub struct AttrDb {
  path: PathBuf,
  fingerprint: String,
  entries: BTreeMap<Vec<String>, AttrValue>,
  dirty: bool,
}

impl AttrDb {
  /// Open the database for `fingerprint` under `cache_dir`.
  ///
  /// An unreadable or outdated file is discarded; the cache is rebuilt on
  /// the next flush.
  pub fn open(cache_dir: &Path, fingerprint: &str) -> Self {
    let path = cache_dir.join(EVAL_CACHE_DIR).join(format!("{}.json", fingerprint));
    let entries = match Self::load(&path, fingerprint) {
      Ok(entries) => entries,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "discarding evaluation cache");
        BTreeMap::new()
      }
    };
    debug!(path = %path.display(), entries = entries.len(), "opened evaluation cache");

    Self {
      path,
      fingerprint: fingerprint.to_string(),
      entries,
      dirty: false,
    }
  }

  fn load(path: &Path, fingerprint: &str) -> Result<BTreeMap<Vec<String>, AttrValue>, EvalCacheError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
      Err(source) => {
        return Err(EvalCacheError::Io {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    let file: DbFile = serde_json::from_str(&content).map_err(EvalCacheError::Parse)?;
    if file.version != DB_VERSION {
      return Err(EvalCacheError::UnsupportedVersion(file.version));
    }
    if file.fingerprint != fingerprint {
      return Err(EvalCacheError::FingerprintMismatch);
    }

    Ok(file.entries.into_iter().map(|e| (e.path, e.value)).collect())
  }

  pub fn get(&self, attr_path: &[String]) -> Option<&AttrValue> {
    self.entries.get(attr_path)
  }

  pub fn set(&mut self, attr_path: Vec<String>, value: AttrValue) {
    if self.entries.get(&attr_path) != Some(&value) {
      self.entries.insert(attr_path, value);
      self.dirty = true;
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Write pending changes, replacing the file atomically.
  pub fn flush(&mut self) -> Result<(), EvalCacheError> {
    if !self.dirty {
      return Ok(());
    }

    let file = DbFile {
      version: DB_VERSION,
      fingerprint: self.fingerprint.clone(),
      entries: self
        .entries
        .iter()
        .map(|(path, value)| DbEntry {
          path: path.clone(),
          value: value.clone(),
        })
        .collect(),
    };
    let content = serde_json::to_vec_pretty(&file).map_err(EvalCacheError::Serialize)?;

    let io_err = |source| EvalCacheError::Io {
      path: self.path.clone(),
      source,
    };
    let dir = self.path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&content).map_err(io_err)?;
    tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

    debug!(path = %self.path.display(), entries = self.entries.len(), "flushed evaluation cache");
    self.dirty = false;
    Ok(())
  }
}

impl Drop for AttrDb {
  fn drop(&mut self) {
    if let Err(e) = self.flush() {
      warn!(error = %e, "failed to write evaluation cache");
    }
  }
}
