//! Cached view over a flake's outputs.
//!
//! An [`EvalCache`] presents the value produced by a root loader as a tree
//! of [`AttrCursor`]s. When a fingerprint is available and caching is
//! enabled, what is learned about each attribute is recorded in an
//! [`AttrDb`] so that later walks, in this process or the next, can answer
//! without evaluating.

mod db;

use std::cell::{OnceCell, RefCell};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, trace};

pub use db::{AttrDb, AttrValue, DB_VERSION};

use crate::eval::attr_path::AttrLookup;
use crate::eval::{EvalError, EvalState, Value};
use crate::flake::{LockedFlake, call_flake};
use crate::settings::Settings;
use crate::store::{Store, StoreError, StorePath};

#[derive(Debug, Error)]
pub enum EvalCacheError {
  #[error(transparent)]
  Eval(#[from] EvalError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse evaluation cache: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize evaluation cache: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported evaluation cache version {0}")]
  UnsupportedVersion(u32),

  #[error("evaluation cache belongs to a different fingerprint")]
  FingerprintMismatch,

  /// A cached derivation path is gone and evaluating again did not bring it back.
  #[error("don't know how to recreate store derivation '{path}'")]
  UnrecreatableDerivation { path: String },
}

/// Produces the root value on a cache miss.
pub type RootLoader = Box<dyn Fn() -> Result<Value, EvalError>>;

pub struct EvalCache {
  db: Option<RefCell<AttrDb>>,
  root_loader: RootLoader,
  root_value: OnceCell<Value>,
}

impl std::fmt::Debug for EvalCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EvalCache")
      .field("enabled", &self.is_enabled())
      .field("loaded", &self.root_value.get().is_some())
      .finish()
  }
}

impl EvalCache {
  /// Without a fingerprint, or with caching disabled in `settings`, every
  /// lookup goes through `root_loader`.
  pub fn new(fingerprint: Option<&str>, settings: &Settings, root_loader: RootLoader) -> Rc<Self> {
    let db = fingerprint
      .filter(|_| settings.eval_cache_enabled())
      .map(|fingerprint| RefCell::new(AttrDb::open(&settings.cache_dir, fingerprint)));

    Rc::new(Self {
      db,
      root_loader,
      root_value: OnceCell::new(),
    })
  }

  pub fn is_enabled(&self) -> bool {
    self.db.is_some()
  }

  pub fn get_root(self: &Rc<Self>) -> Rc<AttrCursor> {
    Rc::new(AttrCursor {
      root: self.clone(),
      parent: None,
      value: RefCell::new(None),
      cached: RefCell::new(None),
    })
  }

  /// Write recorded attributes now rather than when the cache is dropped.
  pub fn flush(&self) -> Result<(), EvalCacheError> {
    match &self.db {
      Some(db) => db.borrow_mut().flush(),
      None => Ok(()),
    }
  }

  fn get_root_value(&self) -> Result<Value, EvalError> {
    if let Some(value) = self.root_value.get() {
      return Ok(value.clone());
    }
    debug!(cached = self.is_enabled(), "evaluating root value");
    let value = (self.root_loader)()?;
    Ok(self.root_value.get_or_init(|| value).clone())
  }

  fn lookup(&self, attr_path: &[String]) -> Option<AttrValue> {
    self.db.as_ref()?.borrow().get(attr_path).cloned()
  }

  fn record(&self, attr_path: Vec<String>, value: AttrValue) {
    if let Some(db) = &self.db {
      db.borrow_mut().set(attr_path, value);
    }
  }
}

/// A position in the tree of a cached root value.
pub struct AttrCursor {
  root: Rc<EvalCache>,
  parent: Option<(Rc<AttrCursor>, String)>,
  value: RefCell<Option<Value>>,
  cached: RefCell<Option<AttrValue>>,
}

impl std::fmt::Debug for AttrCursor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AttrCursor").field("attr_path", &self.attr_path_str()).finish()
  }
}

impl AttrCursor {
  pub fn attr_path(&self) -> Vec<String> {
    match &self.parent {
      None => Vec::new(),
      Some((parent, name)) => {
        let mut path = parent.attr_path();
        path.push(name.clone());
        path
      }
    }
  }

  pub fn attr_path_str(&self) -> String {
    self.attr_path().join(".")
  }

  fn child(self: &Rc<Self>, name: &str) -> Rc<AttrCursor> {
    Rc::new(AttrCursor {
      root: self.root.clone(),
      parent: Some((self.clone(), name.to_string())),
      value: RefCell::new(None),
      cached: RefCell::new(None),
    })
  }

  fn cached_value(&self) -> Option<AttrValue> {
    if let Some(cached) = self.cached.borrow().as_ref() {
      return Some(cached.clone());
    }
    let cached = self.root.lookup(&self.attr_path())?;
    *self.cached.borrow_mut() = Some(cached.clone());
    Some(cached)
  }

  fn record(&self, value: AttrValue) {
    trace!(attr_path = %self.attr_path_str(), value = ?value, "recording attribute");
    self.root.record(self.attr_path(), value.clone());
    *self.cached.borrow_mut() = Some(value);
  }

  /// The evaluated value at this position, evaluating the root if needed.
  pub fn get_value(&self) -> Result<Value, EvalError> {
    if let Some(value) = self.value.borrow().as_ref() {
      return Ok(value.clone());
    }

    let value = match &self.parent {
      None => self.root.get_root_value()?,
      Some((parent, name)) => match parent.get_value()?.force()? {
        Value::Attrs(attrs) => attrs.get(name).cloned().ok_or_else(|| EvalError::MissingAttr {
          attr: self.attr_path_str(),
        })?,
        other => {
          return Err(EvalError::NotAttrs {
            attr_path: parent.attr_path_str(),
            actual: other.type_name(),
          });
        }
      },
    };

    *self.value.borrow_mut() = Some(value.clone());
    Ok(value)
  }

  /// Force the value, recording a failure if it does not evaluate.
  fn force_value(&self) -> Result<Value, EvalError> {
    match self.get_value().and_then(|v| v.force()) {
      Ok(value) => Ok(value),
      Err(e) => {
        self.record(AttrValue::Failed);
        Err(e)
      }
    }
  }

  /// The child `name`, or `None` if this is not an attribute set or has no
  /// such attribute.
  pub fn maybe_get_attr(self: &Rc<Self>, name: &str) -> Result<Option<Rc<AttrCursor>>, EvalError> {
    match self.cached_value() {
      Some(AttrValue::Attrs(names)) => return Ok(names.iter().any(|n| n == name).then(|| self.child(name))),
      Some(AttrValue::Failed) | None => {}
      Some(_) => return Ok(None),
    }

    let value = self.force_value()?;
    self.record(AttrValue::from_value(&value));
    match &value {
      Value::Attrs(attrs) => Ok(attrs.contains_key(name).then(|| self.child(name))),
      _ => Ok(None),
    }
  }

  pub fn get_attr(self: &Rc<Self>, name: &str) -> Result<Rc<AttrCursor>, EvalError> {
    self.maybe_get_attr(name)?.ok_or_else(|| EvalError::MissingAttr {
      attr: self.attr_path().into_iter().chain([name.to_string()]).collect::<Vec<_>>().join("."),
    })
  }

  pub fn find_along_attr_path(self: &Rc<Self>, attr_path: &[String]) -> Result<AttrLookup<Rc<AttrCursor>>, EvalError> {
    let mut cursor = self.clone();
    for (n, name) in attr_path.iter().enumerate() {
      match cursor.maybe_get_attr(name)? {
        Some(child) => cursor = child,
        None => {
          return Ok(AttrLookup::NotFound {
            attr: name.clone(),
            prefix: attr_path[..n].join("."),
          });
        }
      }
    }
    Ok(AttrLookup::Found(cursor))
  }

  pub fn get_string(&self) -> Result<String, EvalError> {
    match self.cached_value() {
      Some(AttrValue::String(s)) => return Ok(s),
      Some(AttrValue::Failed) | None => {}
      Some(other) => {
        return Err(EvalError::TypeMismatch {
          expected: "a string",
          actual: other.type_name(),
        });
      }
    }

    let value = self.force_value()?;
    self.record(AttrValue::from_value(&value));
    match value {
      Value::String(s) => Ok(s.to_string()),
      other => Err(EvalError::TypeMismatch {
        expected: "a string",
        actual: other.type_name(),
      }),
    }
  }

  pub fn get_attrs(&self) -> Result<Vec<String>, EvalError> {
    match self.cached_value() {
      Some(AttrValue::Attrs(names)) => return Ok(names),
      Some(AttrValue::Failed) | None => {}
      Some(other) => {
        return Err(EvalError::NotAttrs {
          attr_path: self.attr_path_str(),
          actual: other.type_name(),
        });
      }
    }

    let value = self.force_value()?;
    self.record(AttrValue::from_value(&value));
    match value {
      Value::Attrs(attrs) => Ok(attrs.keys().cloned().collect()),
      other => Err(EvalError::NotAttrs {
        attr_path: self.attr_path_str(),
        actual: other.type_name(),
      }),
    }
  }

  /// An attribute set whose `type` is the string `"derivation"`.
  pub fn is_derivation(self: &Rc<Self>) -> Result<bool, EvalError> {
    let Some(ty) = self.maybe_get_attr("type")? else {
      return Ok(false);
    };
    match ty.get_string() {
      Ok(ty) => Ok(ty == "derivation"),
      Err(EvalError::TypeMismatch { .. }) => Ok(false),
      Err(e) => Err(e),
    }
  }

  /// The derivation path of this derivation, evaluating again if the cached
  /// path is no longer in the store.
  pub fn force_derivation(self: &Rc<Self>, store: &dyn Store) -> Result<StorePath, EvalCacheError> {
    let drv_attr = self.get_attr("drvPath")?;
    let printed = drv_attr.get_string()?;
    let drv_path = store.store_dir().parse(Path::new(&printed))?;

    if !store.is_valid_path(&drv_path)? && !store.is_read_only() {
      debug!(drv = %printed, "cached derivation is missing, evaluating again");
      // Evaluating the attribute writes the derivation back to the store.
      drv_attr.get_value()?.force()?;
      if !store.is_valid_path(&drv_path)? {
        return Err(EvalCacheError::UnrecreatableDerivation { path: printed });
      }
    }

    Ok(drv_path)
  }
}

/// Open the cache for a locked flake's `outputs`.
///
/// The loader refuses to evaluate when `allow_eval` is off, so a walk
/// either succeeds from the cache or fails with
/// [`EvalError::EvalNotAllowed`].
pub fn open_eval_cache(state: &Rc<EvalState>, locked: &Rc<LockedFlake>) -> Rc<EvalCache> {
  let loader_state = state.clone();
  let loader_flake = locked.clone();
  let loader: RootLoader = Box::new(move || {
    if !loader_state.settings().allow_eval {
      return Err(EvalError::EvalNotAllowed);
    }
    let flake = call_flake(&loader_state, &loader_flake)?;
    flake
      .force_attrs()?
      .get("outputs")
      .cloned()
      .ok_or_else(|| EvalError::MissingAttr {
        attr: "outputs".to_string(),
      })
  });

  EvalCache::new(Some(locked.fingerprint.as_str()), state.settings(), loader)
}
