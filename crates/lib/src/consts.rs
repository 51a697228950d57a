//! Crate-wide constants.

/// Application name used for XDG directories.
pub const APP_NAME: &str = "realise";

/// Length of the hash part of a store path base name.
pub const STORE_PATH_HASH_LEN: usize = 32;

/// File extension marking a store derivation.
pub const DRV_EXTENSION: &str = ".drv";

/// Name of the file holding a flake definition.
pub const FLAKE_FILENAME: &str = "flake.lua";

/// Name of the flake lock file, stored next to [`FLAKE_FILENAME`].
pub const FLAKE_LOCK_FILENAME: &str = "flake.lock";

/// Output name used when an installable does not select one.
pub const DEFAULT_OUTPUT: &str = "out";

/// Name of the input that pins the package collection, and the registry id
/// used when a flake has no such input.
pub const NIXPKGS_INPUT: &str = "nixpkgs";

/// Version tag of the on-disk evaluation cache layout.
pub const EVAL_CACHE_DIR: &str = "eval-cache-v1";

/// Environment variables read by [`crate::settings::Settings::from_env`].
pub mod env {
  pub const STORE: &str = "REALISE_STORE";
  pub const SYSTEM: &str = "REALISE_SYSTEM";
  pub const EVAL_CACHE: &str = "REALISE_EVAL_CACHE";
  pub const PURE_EVAL: &str = "REALISE_PURE_EVAL";
  pub const ALLOW_EVAL: &str = "REALISE_ALLOW_EVAL";
  pub const EXPERIMENTAL_FEATURES: &str = "REALISE_EXPERIMENTAL_FEATURES";
  pub const BUILD_HOOK: &str = "REALISE_BUILD_HOOK";
  pub const REGISTRY: &str = "REALISE_REGISTRY";
  /// Set for build hook processes to the store directory being built into.
  pub const HOOK_STORE_DIR: &str = "REALISE_STORE_DIR";
}
