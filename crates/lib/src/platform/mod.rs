//! Host platform detection.
//!
//! Systems are identified by `<arch>-<os>` strings such as `x86_64-linux` or
//! `aarch64-darwin`; these appear in default flake attribute paths.

pub mod paths;

/// Returns the system string of the running host, e.g. `"x86_64-linux"`.
///
/// Returns `None` if the architecture or OS has no known system name.
pub fn current_system() -> Option<String> {
  system_for(std::env::consts::ARCH, std::env::consts::OS)
}

/// Maps Rust's `ARCH`/`OS` constants to a system string.
pub fn system_for(arch: &str, os: &str) -> Option<String> {
  let arch = match arch {
    "x86_64" | "aarch64" | "riscv64" | "powerpc64" => arch,
    "x86" => "i686",
    "arm" => "armv7l",
    _ => return None,
  };
  let os = match os {
    "linux" | "freebsd" | "openbsd" | "netbsd" => os,
    "macos" => "darwin",
    _ => return None,
  };
  Some(format!("{}-{}", arch, os))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn macos_maps_to_darwin() {
    assert_eq!(system_for("aarch64", "macos").as_deref(), Some("aarch64-darwin"));
  }

  #[test]
  fn x86_is_renamed_to_i686() {
    assert_eq!(system_for("x86", "linux").as_deref(), Some("i686-linux"));
  }

  #[test]
  fn unknown_os_is_unsupported() {
    assert!(system_for("x86_64", "windows").is_none());
    assert!(system_for("mips", "linux").is_none());
  }
}
