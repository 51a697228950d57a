//! Runtime settings.
//!
//! Settings are read once from the environment and then passed explicitly to
//! the evaluator, the store and the orchestrator. Nothing here is global.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::consts::env;
use crate::platform::current_system;
use crate::platform::paths::{cache_dir, config_dir, data_dir};

/// Opt-in features that change resolution semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExperimentalFeature {
  /// Output paths of floating content-addressed derivations are only known
  /// once a realisation has been registered.
  CaDerivations,
}

impl ExperimentalFeature {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::CaDerivations => "ca-derivations",
    }
  }
}

impl fmt::Display for ExperimentalFeature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for ExperimentalFeature {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ca-derivations" => Ok(Self::CaDerivations),
      other => Err(format!("unknown experimental feature '{}'", other)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Settings {
  /// System string used in default attribute paths and exposed to Lua.
  pub system: String,
  /// Root directory of the local store.
  pub store_root: PathBuf,
  /// Directory holding the persistent evaluation cache.
  pub cache_dir: PathBuf,
  /// Location of the user flake registry.
  pub registry_path: PathBuf,
  pub use_eval_cache: bool,
  pub pure_eval: bool,
  /// When false, evaluation that is not served from the cache fails.
  pub allow_eval: bool,
  pub experimental_features: BTreeSet<ExperimentalFeature>,
  /// Program invoked to build derivations, if any.
  pub build_hook: Option<PathBuf>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      system: current_system().unwrap_or_else(|| format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)),
      store_root: data_dir(),
      cache_dir: cache_dir(),
      registry_path: config_dir().join("registry.json"),
      use_eval_cache: true,
      pure_eval: true,
      allow_eval: true,
      experimental_features: BTreeSet::new(),
      build_hook: None,
    }
  }
}

impl Settings {
  /// Build settings from `REALISE_*` environment variables over the defaults.
  pub fn from_env() -> Self {
    let mut settings = Self::default();

    if let Ok(system) = std::env::var(env::SYSTEM) {
      settings.system = system;
    }
    if let Ok(store) = std::env::var(env::STORE) {
      settings.store_root = PathBuf::from(store);
    }
    if let Ok(registry) = std::env::var(env::REGISTRY) {
      settings.registry_path = PathBuf::from(registry);
    }
    if let Ok(hook) = std::env::var(env::BUILD_HOOK)
      && !hook.is_empty()
    {
      settings.build_hook = Some(PathBuf::from(hook));
    }

    settings.use_eval_cache = env_bool(env::EVAL_CACHE, settings.use_eval_cache);
    settings.pure_eval = env_bool(env::PURE_EVAL, settings.pure_eval);
    settings.allow_eval = env_bool(env::ALLOW_EVAL, settings.allow_eval);

    if let Ok(features) = std::env::var(env::EXPERIMENTAL_FEATURES) {
      for name in features.split_whitespace() {
        match name.parse() {
          Ok(feature) => {
            settings.experimental_features.insert(feature);
          }
          Err(e) => warn!(error = %e, "ignoring experimental feature"),
        }
      }
    }

    settings
  }

  pub fn is_experimental_feature_enabled(&self, feature: ExperimentalFeature) -> bool {
    self.experimental_features.contains(&feature)
  }

  /// The evaluation cache is only consulted for pure evaluation.
  pub fn eval_cache_enabled(&self) -> bool {
    self.use_eval_cache && self.pure_eval
  }

  /// Attribute paths tried when a flake reference has no fragment.
  pub fn default_flake_attr_paths(&self) -> Vec<String> {
    vec![
      format!("packages.{}.default", self.system),
      format!("defaultPackage.{}", self.system),
    ]
  }

  /// Prefixes tried, in order, before a fragment is looked up verbatim.
  pub fn default_flake_attr_path_prefixes(&self) -> Vec<String> {
    vec![
      format!("packages.{}.", self.system),
      format!("legacyPackages.{}.", self.system),
    ]
  }
}

fn env_bool(var: &str, default: bool) -> bool {
  match std::env::var(var) {
    Ok(value) => match value.as_str() {
      "1" | "true" | "yes" => true,
      "0" | "false" | "no" => false,
      other => {
        warn!(var, value = other, "invalid boolean, using default");
        default
      }
    },
    Err(_) => default,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use temp_env::with_vars;

  #[test]
  #[serial]
  fn env_overrides_defaults() {
    with_vars(
      [
        (env::SYSTEM, Some("riscv64-linux")),
        (env::STORE, Some("/custom/root")),
        (env::ALLOW_EVAL, Some("0")),
        (env::EXPERIMENTAL_FEATURES, Some("ca-derivations bogus")),
      ],
      || {
        let settings = Settings::from_env();
        assert_eq!(settings.system, "riscv64-linux");
        assert_eq!(settings.store_root, PathBuf::from("/custom/root"));
        assert!(!settings.allow_eval);
        assert!(settings.is_experimental_feature_enabled(ExperimentalFeature::CaDerivations));
        assert_eq!(settings.experimental_features.len(), 1);
      },
    );
  }

  #[test]
  #[serial]
  fn eval_cache_requires_pure_eval() {
    with_vars(
      [(env::PURE_EVAL, Some("false")), (env::EVAL_CACHE, Some("true"))],
      || {
        let settings = Settings::from_env();
        assert!(settings.use_eval_cache);
        assert!(!settings.eval_cache_enabled());
      },
    );
  }

  #[test]
  #[serial]
  fn invalid_boolean_keeps_default() {
    with_vars([(env::EVAL_CACHE, Some("maybe"))], || {
      assert!(Settings::from_env().use_eval_cache);
    });
  }

  #[test]
  fn default_attr_paths_use_system() {
    let settings = Settings {
      system: "x86_64-linux".to_string(),
      ..Settings::default()
    };
    assert_eq!(
      settings.default_flake_attr_paths(),
      vec!["packages.x86_64-linux.default", "defaultPackage.x86_64-linux"]
    );
    assert_eq!(
      settings.default_flake_attr_path_prefixes(),
      vec!["packages.x86_64-linux.", "legacyPackages.x86_64-linux."]
    );
  }
}
