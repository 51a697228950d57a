//! The expression evaluator.
//!
//! Expressions, `--file` roots and flakes are Lua chunks. Their results are
//! converted into lazily-forced [`Value`]s that the attribute-path walker and
//! the installable layer operate on.

pub mod attr_path;
mod builtins;
pub mod lua;
mod value;

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;
use thiserror::Error;
use tracing::{debug, trace};

pub use value::{Attrs, Formals, Lambda, Thunk, Value};

use crate::settings::Settings;
use crate::store::{Store, StoreDir};

/// Arguments supplied to functions that are called automatically
/// (`--argstr name value`).
pub type AutoArgs = BTreeMap<String, String>;

#[derive(Debug, Clone, Error)]
pub enum EvalError {
  #[error("lua error: {0}")]
  Lua(#[from] LuaError),

  /// A value along an attribute path is not an attribute set.
  #[error("the value at '{attr_path}' is not an attribute set but {actual}")]
  NotAttrs { attr_path: String, actual: &'static str },

  #[error("value is {actual} while {expected} was expected")]
  TypeMismatch {
    expected: &'static str,
    actual: &'static str,
  },

  #[error("the expression selected by the selection path '{attr_path}' should be a list but is {actual}")]
  NotAList { attr_path: String, actual: &'static str },

  #[error("list index {index} in selection path '{attr_path}' is out of range")]
  IndexOutOfRange { index: usize, attr_path: String },

  #[error("empty attribute name in selection path '{attr_path}'")]
  EmptyAttrName { attr_path: String },

  #[error("missing closing quote in selection path '{attr_path}'")]
  UnterminatedQuote { attr_path: String },

  #[error("attribute '{attr}' missing")]
  MissingAttr { attr: String },

  #[error("expression does not evaluate to a derivation (or a set or list of those)")]
  NotDerivationLike,

  #[error("cannot convert {what}")]
  CannotConvert { what: &'static str },

  #[error("infinite recursion encountered")]
  InfiniteRecursion,

  /// Evaluation was needed but `allow_eval` is off.
  #[error("not everything is cached, but evaluation is not allowed")]
  EvalNotAllowed,

  #[error("cannot read '{path}': {message}")]
  ReadFile { path: String, message: String },

  #[error("cannot call flake '{flake}': {message}")]
  CallFlake { flake: String, message: String },
}

/// Evaluator state: the Lua VM plus what builtins need.
pub struct EvalState {
  lua: Lua,
  settings: Settings,
  store: Rc<dyn Store>,
}

impl std::fmt::Debug for EvalState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EvalState")
      .field("store_dir", self.store.store_dir())
      .field("pure_eval", &self.settings.pure_eval)
      .finish()
  }
}

impl EvalState {
  pub fn new(settings: Settings, store: Rc<dyn Store>) -> Result<Self, EvalError> {
    let lua = Lua::new();
    builtins::register(&lua, &settings, store.clone())?;
    debug!(pure_eval = settings.pure_eval, system = %settings.system, "created evaluator");
    Ok(Self { lua, settings, store })
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn store(&self) -> &Rc<dyn Store> {
    &self.store
  }

  pub fn store_dir(&self) -> &StoreDir {
    self.store.store_dir()
  }

  pub fn eval_file(&self, path: &Path) -> Result<Value, EvalError> {
    trace!(path = %path.display(), "evaluating file");
    let result = lua::load_file_with_dir(&self.lua, path)?;
    self.from_lua(result)
  }

  /// Evaluate `expr` with `__dir` set to `base_dir`.
  pub fn eval_expr(&self, expr: &str, base_dir: &Path) -> Result<Value, EvalError> {
    trace!(expr, "evaluating expression");
    let result = lua::load_expr_with_dir(&self.lua, expr, base_dir)?;
    self.from_lua(result)
  }

  pub fn from_lua(&self, value: LuaValue) -> Result<Value, EvalError> {
    lua::from_lua(&self.lua, value)
  }

  pub fn force_value(&self, value: &Value) -> Result<Value, EvalError> {
    value.force()
  }

  /// Call `value` if it is a function whose required arguments are all in
  /// `args`. A function without declared formals is only called when there
  /// are arguments to give it. Anything else, including functions missing a
  /// required argument, is returned forced but otherwise unchanged.
  pub fn auto_call_function(&self, args: &AutoArgs, value: &Value) -> Result<Value, EvalError> {
    let value = value.force()?;
    let Value::Lambda(lambda) = &value else {
      return Ok(value);
    };

    match &lambda.formals {
      Formals::Open if args.is_empty() => {
        trace!("not auto-calling open function without arguments");
        Ok(value.clone())
      }
      Formals::Open => lambda.call(args)?.force(),
      Formals::Named(formals) => {
        if let Some((missing, _)) = formals
          .iter()
          .find(|(name, has_default)| !**has_default && !args.contains_key(*name))
        {
          trace!(argument = %missing, "not auto-calling function with missing argument");
          return Ok(value.clone());
        }
        let supplied: AutoArgs = args
          .iter()
          .filter(|(name, _)| formals.contains_key(*name))
          .map(|(name, value)| (name.clone(), value.clone()))
          .collect();
        lambda.call(&supplied)?.force()
      }
    }
  }
}
