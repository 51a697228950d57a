use std::cell::OnceCell;
use std::rc::Rc;

use tracing::debug;

use crate::consts::NIXPKGS_INPUT;
use crate::derived_path::DerivationInfo;
use crate::error::{Error, Result};
use crate::eval::attr_path::{AttrLookup, find_along_attr_path, parse_attr_path, show_attr_paths};
use crate::eval::{AutoArgs, EvalError, EvalState, Value};
use crate::eval_cache::{AttrCursor, EvalCache, open_eval_cache};
use crate::flake::{FlakeError, FlakeRef, InputPath, LockFlags, LockedFlake, Registry, call_flake, lock_flake};
use crate::store::StoreDir;

use super::Pos;

/// A flake reference and the attribute paths to try in it.
#[derive(Debug)]
pub struct InstallableFlake {
  state: Rc<EvalState>,
  registry: Rc<Registry>,
  pub flake_ref: FlakeRef,
  /// Tried after the prefixed forms of the first entry.
  pub attr_paths: Vec<String>,
  pub prefixes: Vec<String>,
  pub lock_flags: LockFlags,
  locked: OnceCell<Rc<LockedFlake>>,
  eval_cache: OnceCell<Rc<EvalCache>>,
}

impl InstallableFlake {
  /// Flake outputs are not functions of the command line, so auto
  /// arguments are refused.
  pub fn new(
    state: Rc<EvalState>,
    registry: Rc<Registry>,
    flake_ref: FlakeRef,
    attr_paths: Vec<String>,
    prefixes: Vec<String>,
    auto_args: &AutoArgs,
    lock_flags: LockFlags,
  ) -> Result<Self> {
    if !auto_args.is_empty() {
      return Err(Error::Usage(
        "'--arg' and '--argstr' are incompatible with flakes".to_string(),
      ));
    }
    if attr_paths.is_empty() {
      return Err(Error::Internal(format!("no attribute paths for flake '{}'", flake_ref)));
    }

    Ok(Self {
      state,
      registry,
      flake_ref,
      attr_paths,
      prefixes,
      lock_flags,
      locked: OnceCell::new(),
      eval_cache: OnceCell::new(),
    })
  }

  pub fn what(&self) -> String {
    format!("{}#{}", self.flake_ref, self.attr_paths[0])
  }

  pub fn store_dir(&self) -> &StoreDir {
    self.state.store_dir()
  }

  /// Every candidate in the order it is tried: each prefix applied to the
  /// first attribute path, then the attribute paths as given.
  pub fn get_actual_attr_paths(&self) -> Vec<String> {
    let mut res: Vec<String> = self
      .prefixes
      .iter()
      .map(|prefix| format!("{}{}", prefix, self.attr_paths[0]))
      .collect();
    res.extend(self.attr_paths.iter().cloned());
    res
  }

  /// Lock the flake on first use; later calls share the result.
  pub fn get_locked_flake(&self) -> Result<Rc<LockedFlake>> {
    if let Some(locked) = self.locked.get() {
      return Ok(locked.clone());
    }

    let flags = LockFlags {
      apply_config: true,
      ..self.lock_flags.clone()
    };
    let locked = Rc::new(lock_flake(&self.state, &self.flake_ref, &flags, &self.registry)?);
    debug!(flake = %self.flake_ref, fingerprint = %locked.fingerprint, "locked flake");
    Ok(self.locked.get_or_init(|| locked).clone())
  }

  /// The locked `nixpkgs` input of this flake, following `follows`, or the
  /// `nixpkgs` registry entry when the flake has none.
  pub fn nixpkgs_flake_ref(&self) -> Result<FlakeRef> {
    let locked = self.get_locked_flake()?;
    let path = InputPath(vec![NIXPKGS_INPUT.to_string()]);
    let found = locked.lock_file.find_input(&path).map_err(FlakeError::from)?;

    if let Some(node) = found.and_then(|index| locked.lock_file.node(index)) {
      debug!(flake = %self.flake_ref, nixpkgs = %node.locked, "using locked nixpkgs input");
      return Ok(node.locked.clone());
    }

    Ok(FlakeRef::Indirect {
      id: NIXPKGS_INPUT.to_string(),
    })
  }

  fn get_eval_cache(&self) -> Result<Rc<EvalCache>> {
    if let Some(cache) = self.eval_cache.get() {
      return Ok(cache.clone());
    }
    let cache = open_eval_cache(&self.state, &self.get_locked_flake()?);
    Ok(self.eval_cache.get_or_init(|| cache).clone())
  }

  fn not_found(&self) -> Error {
    Error::FlakeAttrNotFound {
      flake: self.flake_ref.to_string(),
      attrs: show_attr_paths(&self.get_actual_attr_paths()),
    }
  }

  /// The first candidate that exists. It must be a derivation.
  pub fn to_derivation(&self) -> Result<(String, DerivationInfo)> {
    let root = self.get_eval_cache()?.get_root();
    let store = self.state.store();

    for attr_path in self.get_actual_attr_paths() {
      let tokens = parse_attr_path(&attr_path)?;
      let AttrLookup::Found(attr) = root.find_along_attr_path(&tokens)? else {
        debug!(attr_path = %attr_path, "flake attribute not found, trying next candidate");
        continue;
      };

      if !attr.is_derivation()? {
        return Err(Error::NotADerivation { attr: attr_path });
      }

      let drv_path = attr.force_derivation(&**store)?;
      let out_path = match attr.maybe_get_attr("outPath")? {
        Some(out) => store.store_dir().maybe_parse(&out.get_string()?),
        None => None,
      };
      let output_name = match attr.maybe_get_attr("outputName")? {
        Some(name) => name.get_string()?,
        None => String::new(),
      };

      return Ok((
        attr_path,
        DerivationInfo {
          drv_path,
          out_path,
          output_name,
        },
      ));
    }

    Err(self.not_found())
  }

  pub fn to_derivations(&self) -> Result<Vec<DerivationInfo>> {
    let (_, info) = self.to_derivation()?;
    Ok(vec![info])
  }

  /// Evaluate the first candidate that exists, bypassing the cache.
  pub fn to_value(&self) -> Result<(Value, Pos)> {
    let locked = self.get_locked_flake()?;
    let flake = call_flake(&self.state, &locked)?;
    let outputs = flake
      .force_attrs()?
      .get("outputs")
      .cloned()
      .ok_or_else(|| EvalError::MissingAttr {
        attr: "outputs".to_string(),
      })?;

    let empty_args = AutoArgs::new();
    for attr_path in self.get_actual_attr_paths() {
      match find_along_attr_path(&self.state, &attr_path, &empty_args, &outputs)? {
        AttrLookup::Found(value) => {
          return Ok((
            value,
            Pos {
              origin: self.flake_ref.to_string(),
              attr_path,
            },
          ));
        }
        AttrLookup::NotFound { attr, .. } => {
          debug!(attr_path = %attr_path, attr = %attr, "flake attribute not found, trying next candidate");
        }
      }
    }

    Err(self.not_found())
  }

  /// Cursors for every candidate that exists.
  pub fn get_cursors(&self) -> Result<Vec<Rc<AttrCursor>>> {
    let root = self.get_eval_cache()?.get_root();

    let mut res = Vec::new();
    for attr_path in self.get_actual_attr_paths() {
      if let AttrLookup::Found(attr) = root.find_along_attr_path(&parse_attr_path(&attr_path)?)? {
        res.push(attr);
      }
    }
    Ok(res)
  }
}
