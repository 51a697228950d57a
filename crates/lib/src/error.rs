//! Errors of the installable and orchestration layers.

use thiserror::Error;

use crate::eval::EvalError;
use crate::eval_cache::EvalCacheError;
use crate::flake::{FlakeError, FlakeRefError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
  /// Options that cannot be combined.
  #[error("{0}")]
  Usage(String),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Eval(#[from] EvalError),

  #[error(transparent)]
  EvalCache(#[from] EvalCacheError),

  #[error(transparent)]
  Flake(#[from] FlakeError),

  #[error(transparent)]
  FlakeRef(#[from] FlakeRefError),

  /// An installable that must denote one derivation denotes several or none.
  #[error("installable '{installable}' evaluates to {count} derivations, where only one is expected")]
  Ambiguous { installable: String, count: usize },

  /// The attribute path does not exist in the evaluated expression.
  #[error("attribute '{attr}' in selection path '{attr_path}' not found")]
  AttrNotFound { attr: String, attr_path: String },

  /// No candidate attribute path exists in the flake.
  #[error("flake '{flake}' does not provide attribute {attrs}")]
  FlakeAttrNotFound { flake: String, attrs: String },

  #[error("cannot find flake attribute '{0}'")]
  NoFlakeAttribute(String),

  #[error("flake output attribute '{attr}' is not a derivation")]
  NotADerivation { attr: String },

  #[error("derivation '{drv}' lacks an 'outputName' attribute")]
  MissingOutputName { drv: String },

  /// The derivation does not declare the requested output.
  #[error("the derivation '{drv}' doesn't have an output named '{output}'")]
  MissingOutput { drv: String, output: String },

  /// The output is declared but its content-addressed path is not known yet.
  #[error("cannot operate on an output of unbuilt content-addressed derivation '{id}'")]
  UnbuiltCaOutput { id: String },

  #[error("'{installable}' does not have a known deriver")]
  NoDeriver { installable: String },

  #[error("argument '{installable}' did not evaluate to a derivation")]
  NotADerivationInstallable { installable: String },

  #[error("argument '{installable}' should evaluate to one store path, but evaluated to {count}")]
  NotOneStorePath { installable: String, count: usize },

  #[error("cannot evaluate '{installable}' to a value")]
  CannotEvaluate { installable: String },

  /// A condition the resolver relies on does not hold.
  #[error("internal error: {0}")]
  Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
