//! Realisations of content-addressed outputs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::StorePath;

/// Identity of one output of one derivation, independent of where it ends
/// up in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrvOutput {
  pub drv_hash: String,
  pub output_name: String,
}

impl DrvOutput {
  pub fn new(drv_hash: impl Into<String>, output_name: impl Into<String>) -> Self {
    Self {
      drv_hash: drv_hash.into(),
      output_name: output_name.into(),
    }
  }
}

impl fmt::Display for DrvOutput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}!{}", self.drv_hash, self.output_name)
  }
}

impl FromStr for DrvOutput {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.split_once('!') {
      Some((hash, output)) if !hash.is_empty() && !output.is_empty() => Ok(Self::new(hash, output)),
      _ => Err(format!("invalid derivation output id '{}'", s)),
    }
  }
}

/// Where a [`DrvOutput`] was actually built to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Realisation {
  pub id: DrvOutput,
  pub out_path: StorePath,
}
