//! The store collaborator.
//!
//! Everything the resolver needs from a store goes through the [`Store`]
//! trait. [`LocalStore`] is a directory-backed implementation:
//!
//! ```text
//! <root>/
//! ├── store/                      # store objects; `.drv` files are JSON
//! │   └── <hash>-<name>
//! └── var/db/
//!     ├── derivers/<base>.json    # derivations known to produce <base>
//!     └── realisations/<hash>!<output>.json
//! ```

mod derivation;
mod local;
mod path;
mod realisation;

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

pub use derivation::{Derivation, DerivationOutput, DrvHashModulo, hash_derivation_modulo, static_output_hashes};
pub use local::{BuildHook, CommandBuildHook, LocalStore};
pub use path::{StoreDir, StorePath, output_path_name};
pub use realisation::{DrvOutput, Realisation};

use crate::derived_path::DerivedPath;

/// How [`Store::build_paths`] treats outputs that already exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildMode {
  /// Only build outputs that are missing.
  #[default]
  Normal,
  /// Rebuild outputs even when present, replacing them.
  Repair,
  /// Rebuild outputs and compare against what is present.
  Check,
}

impl BuildMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Normal => "normal",
      Self::Repair => "repair",
      Self::Check => "check",
    }
  }
}

/// What a set of requests would need before it is fully realised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingPaths {
  /// Derivations that would have to be built.
  pub will_build: BTreeSet<StorePath>,
  /// Paths that are invalid and cannot be produced by this store.
  pub unknown: BTreeSet<StorePath>,
}

impl MissingPaths {
  pub fn is_empty(&self) -> bool {
    self.will_build.is_empty() && self.unknown.is_empty()
  }
}

#[derive(Debug, Error)]
pub enum StoreError {
  /// The string is not syntactically a store path.
  #[error("path '{path}' is not a valid store path: {reason}")]
  BadStorePath { path: String, reason: String },

  /// The path does not point into the store directory.
  #[error("path '{path}' is not in the store")]
  NotInStore { path: String },

  #[error("too many levels of symbolic links at '{path}'")]
  SymlinkLoop { path: String },

  #[error("path '{path}' is not valid")]
  InvalidPath { path: String },

  #[error("'{path}' is not a derivation")]
  NotADerivation { path: String },

  #[error("failed to read derivation '{path}': {source}")]
  ReadDerivation {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse store metadata {path}: {source}")]
  Metadata {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize store metadata: {0}")]
  Serialize(#[source] serde_json::Error),

  /// A write was attempted while the store is in read-only mode.
  #[error("cannot {operation} while the store is in read-only mode")]
  ReadOnly { operation: &'static str },

  #[error("cannot build '{drv}': no build hook is configured")]
  NoBuildHook { drv: String },

  #[error("build of '{drv}' failed: {message}")]
  BuildFailed { drv: String, message: String },

  #[error("build hook for '{drv}' reported an unusable result: {message}")]
  HookOutput { drv: String, message: String },
}

impl StoreError {
  /// True for the failures that mean "this string is not a store path", as
  /// opposed to an error encountered while looking.
  pub fn is_not_a_store_path(&self) -> bool {
    matches!(self, Self::BadStorePath { .. } | Self::NotInStore { .. })
  }

  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

pub trait Store {
  fn store_dir(&self) -> &StoreDir;

  /// Follow symlinks starting at `path` until the result lies inside the
  /// store, then parse it.
  fn follow_links_to_store_path(&self, path: &Path) -> Result<StorePath, StoreError>;

  fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError>;

  fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError>;

  /// Write a derivation record and return its path. In read-only mode the
  /// path is computed but nothing is written.
  fn write_derivation(&self, drv: &Derivation) -> Result<StorePath, StoreError>;

  fn add_text_to_store(&self, name: &str, contents: &str) -> Result<StorePath, StoreError>;

  /// Derivations known to have produced `path` whose records are still valid.
  fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, StoreError>;

  fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>, StoreError>;

  /// Realise every request, blocking until all are done or one fails.
  fn build_paths(&self, requests: &[DerivedPath], mode: BuildMode) -> Result<(), StoreError>;

  fn query_missing(&self, requests: &[DerivedPath]) -> Result<MissingPaths, StoreError>;

  fn set_read_only(&self, read_only: bool);

  fn is_read_only(&self) -> bool;

  /// Report what realising `requests` would involve without doing it.
  fn print_missing(&self, requests: &[DerivedPath]) -> Result<MissingPaths, StoreError> {
    let missing = self.query_missing(requests)?;

    if !missing.will_build.is_empty() {
      info!(count = missing.will_build.len(), "derivations will be built");
      for drv in &missing.will_build {
        info!(path = %self.store_dir().print(drv), "will build");
      }
    }
    if !missing.unknown.is_empty() {
      info!(count = missing.unknown.len(), "paths are missing and cannot be produced");
      for path in &missing.unknown {
        info!(path = %self.store_dir().print(path), "unknown");
      }
    }

    Ok(missing)
  }
}
