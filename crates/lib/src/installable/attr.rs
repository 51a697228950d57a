use std::path::Path;
use std::rc::Rc;

use crate::derived_path::DerivationInfo;
use crate::error::{Error, Result};
use crate::eval::attr_path::{AttrLookup, find_along_attr_path, get_derivations};
use crate::eval::{AutoArgs, EvalError, EvalState, Value};
use crate::eval_cache::{AttrCursor, EvalCache, RootLoader};
use crate::store::StoreDir;

use super::Pos;

/// An attribute path into the value of `--file` or `--expr`.
#[derive(Debug, Clone)]
pub struct InstallableAttrPath {
  state: Rc<EvalState>,
  root: Value,
  origin: String,
  attr_path: String,
  auto_args: Rc<AutoArgs>,
}

impl InstallableAttrPath {
  pub fn new(state: Rc<EvalState>, root: Value, origin: String, attr_path: String, auto_args: Rc<AutoArgs>) -> Self {
    Self {
      state,
      root,
      origin,
      attr_path,
      auto_args,
    }
  }

  pub fn what(&self) -> String {
    self.attr_path.clone()
  }

  pub fn store_dir(&self) -> &StoreDir {
    self.state.store_dir()
  }

  pub fn to_value(&self) -> Result<(Value, Pos)> {
    match find_along_attr_path(&self.state, &self.attr_path, &self.auto_args, &self.root)? {
      AttrLookup::Found(value) => Ok((
        self.state.force_value(&value)?,
        Pos {
          origin: self.origin.clone(),
          attr_path: self.attr_path.clone(),
        },
      )),
      AttrLookup::NotFound { attr, .. } => Err(Error::AttrNotFound {
        attr,
        attr_path: self.attr_path.clone(),
      }),
    }
  }

  pub fn to_derivations(&self) -> Result<Vec<DerivationInfo>> {
    let (value, _) = self.to_value()?;
    let store_dir = self.state.store_dir();

    let mut res = Vec::new();
    for drv in get_derivations(&self.state, &value, &self.auto_args)? {
      let drv_path = store_dir.parse(Path::new(&drv.query_drv_path()?))?;
      let out_path = drv
        .query_out_path()?
        .and_then(|path| store_dir.maybe_parse(&path));
      res.push(DerivationInfo {
        drv_path,
        out_path,
        output_name: drv.query_output_name()?.unwrap_or_default(),
      });
    }
    Ok(res)
  }

  /// A cursor over the selected value. Nothing is persisted: expressions
  /// have no fingerprint.
  pub fn get_cursor(&self) -> Rc<AttrCursor> {
    let this = self.clone();
    let loader: RootLoader = Box::new(move || {
      match find_along_attr_path(&this.state, &this.attr_path, &this.auto_args, &this.root)? {
        AttrLookup::Found(value) => this.state.force_value(&value),
        AttrLookup::NotFound { attr, .. } => Err(EvalError::MissingAttr { attr }),
      }
    });
    EvalCache::new(None, self.state.settings(), loader).get_root()
  }
}
