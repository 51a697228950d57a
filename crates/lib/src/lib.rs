//! realise-lib: installable resolution and build realisation.
//!
//! The pipeline runs in three steps:
//! - [`installable`]: parse command-line arguments into store paths,
//!   expression attribute paths or flake references
//! - [`realise`]: turn installables into build requests and hand them to
//!   the store
//! - [`realise::get_built_paths`]: map requests to concrete output paths
//!
//! The store, the Lua evaluator, the evaluation cache and flake locking are
//! the collaborators those steps run against.

pub mod consts;
pub mod derived_path;
pub mod error;
pub mod eval;
pub mod eval_cache;
pub mod flake;
pub mod installable;
pub mod platform;
pub mod realise;
pub mod settings;
pub mod store;
pub mod util;

pub use error::{Error, Result};
