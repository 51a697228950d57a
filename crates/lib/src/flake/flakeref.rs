//! Flake references.
//!
//! | Syntax                   | Meaning                                  |
//! |--------------------------|------------------------------------------|
//! | `path:<dir>`             | the flake in `<dir>`                     |
//! | `/abs/dir`, `./rel`, `~` | the flake in that directory              |
//! | `flake:<id>`, `<id>`     | looked up in the registry                |
//!
//! Any of these may be followed by `#<attribute path>`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::FLAKE_FILENAME;
use crate::platform::paths::home_dir;

#[derive(Debug, Error)]
pub enum FlakeRefError {
  #[error("'{url}' is not a valid flake reference")]
  Invalid { url: String },

  #[error("path '{}' does not exist", path.display())]
  PathNotFound { path: PathBuf },

  /// A bare path was given that has no flake definition.
  #[error("path '{}' is not a flake (because it doesn't contain a '{FLAKE_FILENAME}' file)", path.display())]
  NotAFlake { path: PathBuf },

  #[error("failed to resolve path '{}': {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlakeRef {
  /// A flake in a local directory.
  Path { path: PathBuf },
  /// A symbolic name resolved through the registry.
  Indirect { id: String },
}

impl FlakeRef {
  /// Parse a reference without a fragment, resolving relative paths
  /// against `base_dir`.
  pub fn parse(url: &str, base_dir: &Path) -> Result<Self, FlakeRefError> {
    if let Some(path) = url.strip_prefix("path:") {
      return Ok(Self::Path {
        path: resolve_dir(path, base_dir)?,
      });
    }

    if let Some(id) = url.strip_prefix("flake:") {
      return if is_valid_id(id) {
        Ok(Self::Indirect { id: id.to_string() })
      } else {
        Err(FlakeRefError::Invalid { url: url.to_string() })
      };
    }

    if url == "." || url.starts_with('/') || url.starts_with("./") || url.starts_with("../") || url.starts_with('~') {
      let path = resolve_dir(url, base_dir)?;
      if !path.join(FLAKE_FILENAME).is_file() {
        return Err(FlakeRefError::NotAFlake { path });
      }
      return Ok(Self::Path { path });
    }

    if is_valid_id(url) {
      return Ok(Self::Indirect { id: url.to_string() });
    }

    Err(FlakeRefError::Invalid { url: url.to_string() })
  }

  pub fn is_indirect(&self) -> bool {
    matches!(self, Self::Indirect { .. })
  }

  /// The directory of a path reference.
  pub fn path(&self) -> Option<&Path> {
    match self {
      Self::Path { path } => Some(path),
      Self::Indirect { .. } => None,
    }
  }

  pub fn to_url(&self) -> String {
    match self {
      Self::Path { path } => format!("path:{}", path.display()),
      Self::Indirect { id } => format!("flake:{}", id),
    }
  }
}

impl fmt::Display for FlakeRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_url())
  }
}

/// Split `url#fragment` and parse the reference.
///
/// The fragment is returned verbatim; it is empty when absent.
pub fn parse_flake_ref_with_fragment(s: &str, base_dir: &Path) -> Result<(FlakeRef, String), FlakeRefError> {
  let (url, fragment) = match s.split_once('#') {
    Some((url, fragment)) => (url, fragment),
    None => (s, ""),
  };
  Ok((FlakeRef::parse(url, base_dir)?, fragment.to_string()))
}

/// Registry ids start with a letter and continue with letters, digits,
/// `-` or `_`.
fn is_valid_id(id: &str) -> bool {
  let mut chars = id.chars();
  chars.next().is_some_and(|c| c.is_ascii_alphabetic())
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn resolve_dir(path_str: &str, base_dir: &Path) -> Result<PathBuf, FlakeRefError> {
  let expanded = if let Some(rest) = path_str.strip_prefix("~/") {
    home_dir().join(rest)
  } else if path_str == "~" {
    home_dir()
  } else if path_str.starts_with('/') {
    PathBuf::from(path_str)
  } else {
    base_dir.join(path_str)
  };

  dunce::canonicalize(&expanded).map_err(|e| {
    if e.kind() == io::ErrorKind::NotFound {
      FlakeRefError::PathNotFound { path: expanded.clone() }
    } else {
      FlakeRefError::Io {
        path: expanded.clone(),
        source: e,
      }
    }
  })
}
