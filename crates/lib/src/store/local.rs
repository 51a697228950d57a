//! Directory-backed store.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};

use super::derivation::derivation_path;
use super::{
  BuildMode, Derivation, DerivationOutput, DrvOutput, MissingPaths, Realisation, Store, StoreDir, StoreError,
  StorePath, static_output_hashes,
};
use crate::consts::env;
use crate::derived_path::DerivedPath;
use crate::settings::Settings;

/// Symlink hops tolerated before giving up.
const MAX_SYMLINK_HOPS: usize = 40;

/// The external build executor.
///
/// A hook builds one derivation and reports the path of every output it
/// produced. The store validates and registers the result.
pub trait BuildHook {
  fn build(
    &self,
    store_dir: &StoreDir,
    drv_path: &StorePath,
    drv: &Derivation,
    mode: BuildMode,
  ) -> Result<BTreeMap<String, StorePath>, StoreError>;
}

impl<F> BuildHook for F
where
  F: Fn(&StoreDir, &StorePath, &Derivation, BuildMode) -> Result<BTreeMap<String, StorePath>, StoreError>,
{
  fn build(
    &self,
    store_dir: &StoreDir,
    drv_path: &StorePath,
    drv: &Derivation,
    mode: BuildMode,
  ) -> Result<BTreeMap<String, StorePath>, StoreError> {
    self(store_dir, drv_path, drv, mode)
  }
}

/// Runs `<program> <drv-path> <mode>` and reads a JSON object mapping output
/// names to full store paths from its stdout.
#[derive(Debug, Clone)]
pub struct CommandBuildHook {
  program: PathBuf,
}

impl CommandBuildHook {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self { program: program.into() }
  }
}

impl BuildHook for CommandBuildHook {
  fn build(
    &self,
    store_dir: &StoreDir,
    drv_path: &StorePath,
    _drv: &Derivation,
    mode: BuildMode,
  ) -> Result<BTreeMap<String, StorePath>, StoreError> {
    let printed = store_dir.print(drv_path);
    info!(drv = %printed, hook = %self.program.display(), "running build hook");

    let output = Command::new(&self.program)
      .arg(&printed)
      .arg(mode.as_str())
      .env(env::HOOK_STORE_DIR, store_dir.as_path())
      .output()
      .map_err(|e| StoreError::io(&self.program, e))?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
      let message = if stderr.is_empty() {
        format!("build hook exited with {:?}", output.status.code())
      } else {
        stderr
      };
      return Err(StoreError::BuildFailed { drv: printed, message });
    }

    let hook_error = |message: String| StoreError::HookOutput {
      drv: printed.clone(),
      message,
    };

    let reported: BTreeMap<String, String> =
      serde_json::from_slice(&output.stdout).map_err(|e| hook_error(e.to_string()))?;

    reported
      .into_iter()
      .map(|(name, path)| {
        let path = store_dir
          .parse(Path::new(&path))
          .map_err(|e| hook_error(e.to_string()))?;
        Ok((name, path))
      })
      .collect()
  }
}

/// A store rooted at a local directory.
pub struct LocalStore {
  store_dir: StoreDir,
  db_dir: PathBuf,
  build_hook: Option<Box<dyn BuildHook>>,
  read_only: Cell<bool>,
  /// Derivations computed while read-only. They are readable for the
  /// lifetime of the store but never reach disk.
  unwritten: RefCell<BTreeMap<StorePath, Derivation>>,
}

impl std::fmt::Debug for LocalStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LocalStore")
      .field("store_dir", &self.store_dir)
      .field("has_build_hook", &self.build_hook.is_some())
      .field("read_only", &self.read_only.get())
      .field("unwritten", &self.unwritten.borrow().len())
      .finish()
  }
}

impl LocalStore {
  /// Open (creating if needed) the store rooted at `root`.
  pub fn open(root: &Path) -> Result<Self, StoreError> {
    let store_dir = root.join("store");
    let db_dir = root.join("var").join("db");

    for dir in [&store_dir, &db_dir.join("derivers"), &db_dir.join("realisations")] {
      fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    }

    // Symlink resolution compares against the canonical location.
    let store_dir = dunce::canonicalize(&store_dir).map_err(|e| StoreError::io(&store_dir, e))?;
    debug!(store_dir = %store_dir.display(), "opened local store");

    Ok(Self {
      store_dir: StoreDir::new(store_dir),
      db_dir,
      build_hook: None,
      read_only: Cell::new(false),
      unwritten: RefCell::new(BTreeMap::new()),
    })
  }

  /// Open the store described by `settings`, attaching a
  /// [`CommandBuildHook`] when one is configured.
  pub fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
    let store = Self::open(&settings.store_root)?;
    Ok(match &settings.build_hook {
      Some(program) => store.with_build_hook(CommandBuildHook::new(program)),
      None => store,
    })
  }

  pub fn with_build_hook(mut self, hook: impl BuildHook + 'static) -> Self {
    self.build_hook = Some(Box::new(hook));
    self
  }

  /// Record that `drv_path` produced `path`.
  pub fn register_deriver(&self, path: &StorePath, drv_path: &StorePath) -> Result<(), StoreError> {
    self.check_writable("register a deriver")?;
    let file = self.deriver_file(path);
    let mut derivers: BTreeSet<StorePath> = read_json(&file)?.unwrap_or_default();
    if derivers.insert(drv_path.clone()) {
      write_json(&file, &derivers)?;
    }
    Ok(())
  }

  pub fn register_realisation(&self, realisation: &Realisation) -> Result<(), StoreError> {
    self.check_writable("register a realisation")?;
    trace!(id = %realisation.id, path = %realisation.out_path, "registering realisation");
    write_json(&self.realisation_file(&realisation.id), realisation)
  }

  fn deriver_file(&self, path: &StorePath) -> PathBuf {
    self
      .db_dir
      .join("derivers")
      .join(format!("{}.json", path.base_name()))
  }

  fn realisation_file(&self, id: &DrvOutput) -> PathBuf {
    self.db_dir.join("realisations").join(format!("{}.json", id))
  }

  fn check_writable(&self, operation: &'static str) -> Result<(), StoreError> {
    if self.read_only.get() {
      return Err(StoreError::ReadOnly { operation });
    }
    Ok(())
  }

  /// Wanted outputs of `drv` that have no valid path yet.
  fn missing_outputs(
    &self,
    drv_path: &StorePath,
    drv: &Derivation,
    wanted: &BTreeSet<String>,
  ) -> Result<BTreeSet<String>, StoreError> {
    let unknown: Vec<&str> = wanted
      .iter()
      .filter(|name| !drv.outputs.contains_key(*name))
      .map(String::as_str)
      .collect();
    if !unknown.is_empty() {
      return Err(StoreError::HookOutput {
        drv: self.store_dir.print(drv_path),
        message: format!("derivation does not have wanted outputs {}", unknown.join(", ")),
      });
    }

    let hashes = if drv.is_content_addressed() {
      Some(static_output_hashes(self, drv)?)
    } else {
      None
    };

    let mut missing = BTreeSet::new();
    for name in wanted {
      let path = match (&drv.outputs[name], &hashes) {
        (DerivationOutput::CaFloating { .. }, Some(hashes)) => self
          .query_realisation(&DrvOutput::new(hashes[name].clone(), name.clone()))?
          .map(|r| r.out_path),
        (output, _) => output.static_path().cloned(),
      };
      let present = match path {
        Some(path) => self.is_valid_path(&path)?,
        None => false,
      };
      if !present {
        missing.insert(name.clone());
      }
    }
    Ok(missing)
  }

  fn collect_missing(
    &self,
    drv_path: &StorePath,
    wanted: &BTreeSet<String>,
    missing: &mut MissingPaths,
    visited: &mut BTreeSet<StorePath>,
  ) -> Result<(), StoreError> {
    if !visited.insert(drv_path.clone()) {
      return Ok(());
    }
    if !self.is_valid_path(drv_path)? {
      missing.unknown.insert(drv_path.clone());
      return Ok(());
    }

    let drv = self.read_derivation(drv_path)?;
    if self.missing_outputs(drv_path, &drv, wanted)?.is_empty() {
      return Ok(());
    }

    missing.will_build.insert(drv_path.clone());
    for (input, outputs) in &drv.input_drvs {
      self.collect_missing(input, outputs, missing, visited)?;
    }
    Ok(())
  }

  fn ensure_built(
    &self,
    drv_path: &StorePath,
    wanted: &BTreeSet<String>,
    mode: BuildMode,
    done: &mut BTreeSet<StorePath>,
  ) -> Result<(), StoreError> {
    if done.contains(drv_path) {
      return Ok(());
    }

    let drv = self.read_derivation(drv_path)?;
    for (input, outputs) in &drv.input_drvs {
      self.ensure_built(input, outputs, BuildMode::Normal, done)?;
    }

    let missing = self.missing_outputs(drv_path, &drv, wanted)?;
    if missing.is_empty() && mode == BuildMode::Normal {
      trace!(drv = %drv_path, "outputs already valid");
      done.insert(drv_path.clone());
      return Ok(());
    }

    let Some(hook) = &self.build_hook else {
      return Err(StoreError::NoBuildHook {
        drv: self.store_dir.print(drv_path),
      });
    };

    info!(drv = %self.store_dir.print(drv_path), mode = mode.as_str(), "building");
    let built = hook.build(&self.store_dir, drv_path, &drv, mode)?;
    self.register_outputs(drv_path, &drv, wanted, &built)?;
    done.insert(drv_path.clone());
    Ok(())
  }

  /// Validate what a hook reported and record realisations and derivers.
  fn register_outputs(
    &self,
    drv_path: &StorePath,
    drv: &Derivation,
    wanted: &BTreeSet<String>,
    built: &BTreeMap<String, StorePath>,
  ) -> Result<(), StoreError> {
    let printed = self.store_dir.print(drv_path);
    let hook_error = |message: String| StoreError::HookOutput {
      drv: printed.clone(),
      message,
    };

    if let Some(name) = wanted.iter().find(|name| !built.contains_key(*name)) {
      return Err(hook_error(format!("output '{}' was not reported", name)));
    }

    let hashes = static_output_hashes(self, drv)?;

    for (name, path) in built {
      let Some(output) = drv.outputs.get(name) else {
        return Err(hook_error(format!("unknown output '{}'", name)));
      };
      if !self.is_valid_path(path)? {
        return Err(hook_error(format!(
          "output path '{}' was not created",
          self.store_dir.print(path)
        )));
      }
      if let Some(expected) = output.static_path()
        && expected != path
      {
        return Err(hook_error(format!(
          "output '{}' should be '{}' but was '{}'",
          name,
          self.store_dir.print(expected),
          self.store_dir.print(path)
        )));
      }

      if let Some(hash) = hashes.get(name) {
        self.register_realisation(&Realisation {
          id: DrvOutput::new(hash.clone(), name.clone()),
          out_path: path.clone(),
        })?;
      }
      self.register_deriver(path, drv_path)?;
    }

    Ok(())
  }
}

impl Store for LocalStore {
  fn store_dir(&self) -> &StoreDir {
    &self.store_dir
  }

  fn follow_links_to_store_path(&self, path: &Path) -> Result<StorePath, StoreError> {
    let mut current = normalize(&std::path::absolute(path).map_err(|e| StoreError::io(path, e))?);

    for _ in 0..MAX_SYMLINK_HOPS {
      if self.store_dir.is_in_store(&current) {
        return self.store_dir.parse(&current);
      }

      match fs::symlink_metadata(&current) {
        Ok(meta) if meta.file_type().is_symlink() => {
          let target = fs::read_link(&current).map_err(|e| StoreError::io(&current, e))?;
          let base = current.parent().unwrap_or(Path::new("/"));
          current = normalize(&base.join(target));
        }
        Ok(_) => return self.store_dir.parse(&current),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return self.store_dir.parse(&current),
        Err(e) => return Err(StoreError::io(&current, e)),
      }
    }

    Err(StoreError::SymlinkLoop {
      path: path.display().to_string(),
    })
  }

  fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError> {
    if self.unwritten.borrow().contains_key(path) {
      return Ok(true);
    }
    let full = self.store_dir.to_path(path);
    match fs::symlink_metadata(&full) {
      Ok(_) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(StoreError::io(&full, e)),
    }
  }

  fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError> {
    if !drv_path.is_derivation() {
      return Err(StoreError::NotADerivation {
        path: self.store_dir.print(drv_path),
      });
    }

    if let Some(drv) = self.unwritten.borrow().get(drv_path) {
      return Ok(drv.clone());
    }

    let full = self.store_dir.to_path(drv_path);
    let content = match fs::read(&full) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(StoreError::InvalidPath {
          path: full.display().to_string(),
        });
      }
      Err(e) => return Err(StoreError::io(&full, e)),
    };

    serde_json::from_slice(&content).map_err(|source| StoreError::ReadDerivation {
      path: full.display().to_string(),
      source,
    })
  }

  fn write_derivation(&self, drv: &Derivation) -> Result<StorePath, StoreError> {
    let (path, contents) = derivation_path(&self.store_dir, drv)?;
    if self.read_only.get() {
      if !self.is_valid_path(&path)? {
        trace!(path = %self.store_dir.print(&path), "keeping derivation in memory");
        self.unwritten.borrow_mut().insert(path.clone(), drv.clone());
      }
      return Ok(path);
    }

    let full = self.store_dir.to_path(&path);
    if !full.exists() {
      write_atomic(&full, &contents)?;
      debug!(path = %self.store_dir.print(&path), "wrote derivation");
    }
    self.unwritten.borrow_mut().remove(&path);
    Ok(path)
  }

  fn add_text_to_store(&self, name: &str, contents: &str) -> Result<StorePath, StoreError> {
    let path = self.store_dir.make_text_path(name, contents.as_bytes())?;
    if !self.read_only.get() && !self.is_valid_path(&path)? {
      write_atomic(&self.store_dir.to_path(&path), contents.as_bytes())?;
    }
    Ok(path)
  }

  fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, StoreError> {
    let derivers: BTreeSet<StorePath> = read_json(&self.deriver_file(path))?.unwrap_or_default();
    let mut valid = BTreeSet::new();
    for drv in derivers {
      if self.is_valid_path(&drv)? {
        valid.insert(drv);
      }
    }
    Ok(valid)
  }

  fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>, StoreError> {
    read_json(&self.realisation_file(id))
  }

  fn build_paths(&self, requests: &[DerivedPath], mode: BuildMode) -> Result<(), StoreError> {
    self.check_writable("build paths")?;

    let mut done = BTreeSet::new();
    for request in requests {
      match request {
        DerivedPath::Opaque { path } => {
          if !self.is_valid_path(path)? {
            return Err(StoreError::InvalidPath {
              path: self.store_dir.print(path),
            });
          }
        }
        DerivedPath::Built { drv_path, outputs } => {
          self.ensure_built(drv_path, outputs, mode, &mut done)?;
        }
      }
    }
    Ok(())
  }

  fn query_missing(&self, requests: &[DerivedPath]) -> Result<MissingPaths, StoreError> {
    let mut missing = MissingPaths::default();
    let mut visited = BTreeSet::new();
    for request in requests {
      match request {
        DerivedPath::Opaque { path } => {
          if !self.is_valid_path(path)? {
            missing.unknown.insert(path.clone());
          }
        }
        DerivedPath::Built { drv_path, outputs } => {
          self.collect_missing(drv_path, outputs, &mut missing, &mut visited)?;
        }
      }
    }
    Ok(missing)
  }

  fn set_read_only(&self, read_only: bool) {
    self.read_only.set(read_only);
  }

  fn is_read_only(&self) -> bool {
    self.read_only.get()
  }
}

/// Resolve `.` and `..` lexically.
fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::ParentDir => {
        out.pop();
      }
      Component::CurDir => {}
      other => out.push(other),
    }
  }
  out
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(StoreError::io(path, e)),
  };
  serde_json::from_str(&content)
    .map(Some)
    .map_err(|source| StoreError::Metadata {
      path: path.to_path_buf(),
      source,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
  let content = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
  write_atomic(path, &content)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
  let dir = path.parent().unwrap_or(Path::new("."));
  let mut file = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
  file.write_all(contents).map_err(|e| StoreError::io(path, e))?;
  file.persist(path).map_err(|e| StoreError::io(path, e.error))?;
  Ok(())
}
