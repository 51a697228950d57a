//! Store path syntax.
//!
//! A store path is `<store-dir>/<hash>-<name>` where `<hash>` is
//! [`STORE_PATH_HASH_LEN`] characters from `[0-9a-z]`. Paths are held as
//! base names and only become filesystem paths against a [`StoreDir`].

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::StoreError;
use crate::consts::{DRV_EXTENSION, STORE_PATH_HASH_LEN};
use crate::util::hash::hash_bytes;

/// The base name of a store object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
  base_name: String,
}

impl StorePath {
  /// Parse a base name such as `0123...-hello-1.0`.
  pub fn from_base_name(base_name: &str) -> Result<Self, StoreError> {
    let bad = |reason: &str| StoreError::BadStorePath {
      path: base_name.to_string(),
      reason: reason.to_string(),
    };

    if base_name.len() < STORE_PATH_HASH_LEN + 2 {
      return Err(bad("path is too short"));
    }

    let (hash, rest) = base_name.split_at(STORE_PATH_HASH_LEN);
    if !hash.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()) {
      return Err(bad("invalid hash part"));
    }

    let Some(name) = rest.strip_prefix('-') else {
      return Err(bad("missing '-' after hash part"));
    };
    validate_name(name).map_err(|reason| bad(&reason))?;

    Ok(Self {
      base_name: base_name.to_string(),
    })
  }

  pub fn base_name(&self) -> &str {
    &self.base_name
  }

  pub fn hash_part(&self) -> &str {
    &self.base_name[..STORE_PATH_HASH_LEN]
  }

  pub fn name(&self) -> &str {
    &self.base_name[STORE_PATH_HASH_LEN + 1..]
  }

  pub fn is_derivation(&self) -> bool {
    self.base_name.ends_with(DRV_EXTENSION)
  }
}

impl fmt::Display for StorePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.base_name)
  }
}

impl FromStr for StorePath {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::from_base_name(s)
  }
}

impl Serialize for StorePath {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.base_name)
  }
}

impl<'de> Deserialize<'de> for StorePath {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Self::from_base_name(&s).map_err(serde::de::Error::custom)
  }
}

fn validate_name(name: &str) -> Result<(), String> {
  if name.is_empty() {
    return Err("name is empty".to_string());
  }
  if name.starts_with('.') {
    return Err("name must not start with '.'".to_string());
  }
  if let Some(c) = name
    .chars()
    .find(|c| !(c.is_ascii_alphanumeric() || "+-._?=".contains(*c)))
  {
    return Err(format!("invalid character '{}' in name", c));
  }
  Ok(())
}

/// The directory all store paths live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir(PathBuf);

impl StoreDir {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self(path.into())
  }

  pub fn as_path(&self) -> &Path {
    &self.0
  }

  /// Full filesystem location of a store path.
  pub fn to_path(&self, path: &StorePath) -> PathBuf {
    self.0.join(path.base_name())
  }

  pub fn print(&self, path: &StorePath) -> String {
    self.to_path(path).display().to_string()
  }

  /// Whether `path` is lexically inside the store directory.
  pub fn is_in_store(&self, path: &Path) -> bool {
    path.starts_with(&self.0) && path != self.0
  }

  /// Parse a full path into a store path.
  ///
  /// Paths below a store object (`<store>/<hash>-<name>/bin/hello`) resolve
  /// to the store object itself.
  pub fn parse(&self, path: &Path) -> Result<StorePath, StoreError> {
    let rel = path.strip_prefix(&self.0).map_err(|_| StoreError::NotInStore {
      path: path.display().to_string(),
    })?;

    match rel.components().next() {
      Some(Component::Normal(base)) => StorePath::from_base_name(&base.to_string_lossy()),
      _ => Err(StoreError::NotInStore {
        path: path.display().to_string(),
      }),
    }
  }

  /// Like [`StoreDir::parse`] but returns `None` for anything that is not a
  /// store path, including the empty string.
  pub fn maybe_parse(&self, path: &str) -> Option<StorePath> {
    if path.is_empty() {
      return None;
    }
    self.parse(Path::new(path)).ok()
  }

  /// Build a store path whose hash part is derived from a fingerprint
  /// string, so the same inputs always yield the same path.
  pub fn make_store_path(&self, kind: &str, digest: &str, name: &str) -> Result<StorePath, StoreError> {
    let fingerprint = format!("{}:sha256:{}:{}:{}", kind, digest, self.0.display(), name);
    let hash = hash_bytes(fingerprint.as_bytes());
    StorePath::from_base_name(&format!("{}-{}", hash.truncated(STORE_PATH_HASH_LEN), name))
  }

  /// Path of an input-addressed output, `<drv-name>` for `out` and
  /// `<drv-name>-<output>` otherwise.
  pub fn make_output_path(&self, output_name: &str, drv_hash: &str, drv_name: &str) -> Result<StorePath, StoreError> {
    let name = output_path_name(drv_name, output_name);
    self.make_store_path(&format!("output:{}", output_name), drv_hash, &name)
  }

  /// Path of a fixed-output derivation's output.
  pub fn make_fixed_output_path(&self, hash: &str, name: &str) -> Result<StorePath, StoreError> {
    self.make_store_path("fixed:out", hash, name)
  }

  /// Path of a content-addressed text file, such as a `.drv`.
  pub fn make_text_path(&self, name: &str, contents: &[u8]) -> Result<StorePath, StoreError> {
    self.make_store_path("text", &hash_bytes(contents).0, name)
  }
}

pub fn output_path_name(drv_name: &str, output_name: &str) -> String {
  if output_name == crate::consts::DEFAULT_OUTPUT {
    drv_name.to_string()
  } else {
    format!("{}-{}", drv_name, output_name)
  }
}
