//! Derivation records and their hashes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Store, StoreDir, StoreError, StorePath};
use crate::util::hash::hash_bytes;

/// How the path of one derivation output is determined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DerivationOutput {
  /// Path fixed by the derivation's inputs.
  InputAddressed { path: StorePath },
  /// Fixed-output: the content hash is declared, so the path is too.
  CaFixed { hash: String, path: StorePath },
  /// Path only known once the output has been built and hashed.
  #[serde(rename_all = "camelCase")]
  CaFloating { hash_algo: String },
  /// Path not yet computed.
  Deferred,
}

impl DerivationOutput {
  pub fn static_path(&self) -> Option<&StorePath> {
    match self {
      Self::InputAddressed { path } | Self::CaFixed { path, .. } => Some(path),
      Self::CaFloating { .. } | Self::Deferred => None,
    }
  }
}

/// A build recipe as stored in a `.drv` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Derivation {
  pub name: String,
  pub system: String,
  pub builder: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  /// Input derivations and the outputs of each that are used.
  #[serde(default)]
  pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
  #[serde(default)]
  pub input_srcs: BTreeSet<StorePath>,
  pub outputs: BTreeMap<String, DerivationOutput>,
}

impl Derivation {
  pub fn output_names(&self) -> BTreeSet<String> {
    self.outputs.keys().cloned().collect()
  }

  /// Every output with its path, if the path is statically known.
  pub fn outputs_and_opt_paths(&self) -> BTreeMap<String, Option<StorePath>> {
    self
      .outputs
      .iter()
      .map(|(name, output)| (name.clone(), output.static_path().cloned()))
      .collect()
  }

  pub fn is_fixed_output(&self) -> bool {
    self.outputs.len() == 1 && matches!(self.outputs.get("out"), Some(DerivationOutput::CaFixed { .. }))
  }

  pub fn is_content_addressed(&self) -> bool {
    self
      .outputs
      .values()
      .any(|o| matches!(o, DerivationOutput::CaFloating { .. }))
  }

  /// Compute the paths of deferred outputs from the derivation hash.
  ///
  /// Derivations declared with deferred outputs become input-addressed.
  /// Fixed and floating outputs are left alone. Environment variables named
  /// after outputs are masked while hashing, so they may already hold the
  /// paths.
  pub fn fill_input_addressed_paths(&mut self, store: &dyn Store) -> Result<(), StoreError> {
    let hash = match hash_derivation_modulo(store, self, true, &mut HashMap::new())? {
      DrvHashModulo::Regular(hash) => hash,
      DrvHashModulo::FixedOutput(_) => return Ok(()),
    };

    let store_dir = store.store_dir();
    for (output_name, output) in self.outputs.iter_mut() {
      if matches!(output, DerivationOutput::Deferred) {
        *output = DerivationOutput::InputAddressed {
          path: store_dir.make_output_path(output_name, &hash, &self.name)?,
        };
      }
    }
    Ok(())
  }

  /// Serialized form used for the `.drv` file and its hash.
  pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(self).map_err(StoreError::Serialize)
  }
}

/// The identity of a derivation "modulo" fixed-output inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrvHashModulo {
  /// One hash shared by every output.
  Regular(String),
  /// Fixed-output derivations hash each output by its declared content.
  FixedOutput(BTreeMap<String, String>),
}

impl DrvHashModulo {
  /// Hash standing in for this derivation inside a dependent's record.
  fn as_input_key(&self, outputs: &BTreeSet<String>) -> String {
    match self {
      Self::Regular(hash) => hash.clone(),
      Self::FixedOutput(hashes) => {
        let joined: Vec<&str> = outputs
          .iter()
          .filter_map(|o| hashes.get(o).map(String::as_str))
          .collect();
        hash_bytes(joined.join(":").as_bytes()).0
      }
    }
  }
}

/// Hash a derivation with its input derivations replaced by their own
/// hashes, so changes to how a fixed-output input is fetched do not change
/// dependents.
///
/// With `mask_outputs` the output paths are blanked before hashing, which is
/// how input-addressed output paths are derived. `memo` caches input
/// derivation hashes by path.
pub fn hash_derivation_modulo(
  store: &dyn Store,
  drv: &Derivation,
  mask_outputs: bool,
  memo: &mut HashMap<StorePath, DrvHashModulo>,
) -> Result<DrvHashModulo, StoreError> {
  if drv.is_fixed_output() {
    let hashes = drv
      .outputs
      .iter()
      .filter_map(|(name, output)| match output {
        DerivationOutput::CaFixed { hash, path } => {
          let fingerprint = format!("fixed:out:{}:{}", hash, store.store_dir().print(path));
          Some((name.clone(), hash_bytes(fingerprint.as_bytes()).0))
        }
        _ => None,
      })
      .collect();
    return Ok(DrvHashModulo::FixedOutput(hashes));
  }

  let mut inputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
  for (input_path, input_outputs) in &drv.input_drvs {
    let input_hash = match memo.get(input_path) {
      Some(hash) => hash.clone(),
      None => {
        let input_drv = store.read_derivation(input_path)?;
        let hash = hash_derivation_modulo(store, &input_drv, true, memo)?;
        memo.insert(input_path.clone(), hash.clone());
        hash
      }
    };
    inputs.insert(input_hash.as_input_key(input_outputs), input_outputs.clone());
  }

  let outputs: BTreeMap<&str, DerivationOutput> = drv
    .outputs
    .iter()
    .map(|(name, output)| {
      let output = match output {
        DerivationOutput::CaFloating { .. } => output.clone(),
        _ if mask_outputs => DerivationOutput::Deferred,
        _ => output.clone(),
      };
      (name.as_str(), output)
    })
    .collect();

  let env: BTreeMap<&str, &str> = drv
    .env
    .iter()
    .map(|(key, value)| {
      let value = if mask_outputs && drv.outputs.contains_key(key) {
        ""
      } else {
        value.as_str()
      };
      (key.as_str(), value)
    })
    .collect();

  let modulo = serde_json::json!({
    "name": drv.name,
    "system": drv.system,
    "builder": drv.builder,
    "args": drv.args,
    "env": env,
    "inputDrvs": inputs,
    "inputSrcs": drv.input_srcs,
    "outputs": outputs,
  });
  let serialized = serde_json::to_vec(&modulo).map_err(StoreError::Serialize)?;
  let hash = hash_bytes(&serialized).0;
  trace!(name = %drv.name, hash = %hash, "hashed derivation");
  Ok(DrvHashModulo::Regular(hash))
}

/// Per-output hash used to key realisations of `drv`'s outputs.
///
/// Input derivation hashes are memoised within this call only.
pub fn static_output_hashes(store: &dyn Store, drv: &Derivation) -> Result<BTreeMap<String, String>, StoreError> {
  match hash_derivation_modulo(store, drv, true, &mut HashMap::new())? {
    DrvHashModulo::Regular(hash) => Ok(drv.outputs.keys().map(|name| (name.clone(), hash.clone())).collect()),
    DrvHashModulo::FixedOutput(hashes) => Ok(hashes),
  }
}

/// Path a derivation record would be written to.
pub(crate) fn derivation_path(store_dir: &StoreDir, drv: &Derivation) -> Result<(StorePath, Vec<u8>), StoreError> {
  let contents = drv.to_json()?;
  let path = store_dir.make_text_path(&format!("{}{}", drv.name, crate::consts::DRV_EXTENSION), &contents)?;
  Ok((path, contents))
}
