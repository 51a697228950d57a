//! XDG-style directories for realise state.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Returns the user's home directory.
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/"))
}

fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
  let base = std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
    fallback
      .iter()
      .fold(home_dir(), |path, component| path.join(component))
  });
  base.join(APP_NAME)
}

/// Directory for configuration such as the flake registry.
pub fn config_dir() -> PathBuf {
  xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

/// Directory holding the default local store.
pub fn data_dir() -> PathBuf {
  xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

/// Directory for disposable state such as the evaluation cache.
pub fn cache_dir() -> PathBuf {
  xdg_dir("XDG_CACHE_HOME", &[".cache"])
}
