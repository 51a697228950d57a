//! Fixtures shared by unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use tempfile::TempDir;

use crate::store::{
  BuildMode, Derivation, DerivationOutput, LocalStore, Store, StoreDir, StoreError, StorePath, output_path_name,
};

/// A scratch [`LocalStore`] living in a temporary directory.
pub struct TestStore {
  pub temp: TempDir,
  pub store: Rc<LocalStore>,
}

impl TestStore {
  pub fn new() -> Self {
    Self::open(|store| store)
  }

  pub fn with_hook<F>(hook: F) -> Self
  where
    F: Fn(&StoreDir, &StorePath, &Derivation, BuildMode) -> Result<BTreeMap<String, StorePath>, StoreError> + 'static,
  {
    Self::open(|store| store.with_build_hook(hook))
  }

  /// A store whose hook writes every output of the derivation it is given.
  /// Floating outputs get a path derived from the derivation name.
  pub fn building() -> Self {
    Self::with_hook(|store_dir: &StoreDir, _drv_path: &StorePath, drv: &Derivation, _mode| {
      let mut outputs = BTreeMap::new();
      for (name, path) in drv.outputs_and_opt_paths() {
        let path = match path {
          Some(path) => path,
          None => store_dir.make_store_path("ca", &format!("{}!{}", drv.name, name), &output_path_name(&drv.name, &name))?,
        };
        fs::write(store_dir.to_path(&path), &drv.name).unwrap();
        outputs.insert(name, path);
      }
      Ok(outputs)
    })
  }

  fn open(configure: impl FnOnce(LocalStore) -> LocalStore) -> Self {
    let temp = TempDir::new().unwrap();
    let store = LocalStore::open(&temp.path().join("root")).unwrap();
    fs::create_dir_all(temp.path().join("scratch")).unwrap();
    Self {
      temp,
      store: Rc::new(configure(store)),
    }
  }

  /// A directory outside the store.
  pub fn scratch(&self) -> PathBuf {
    dunce::canonicalize(self.temp.path().join("scratch")).unwrap()
  }

  pub fn add_drv(&self, name: &str, outputs: &[&str]) -> StorePath {
    self.add_drv_with_inputs(name, outputs, &[])
  }

  /// Write an input-addressed derivation depending on `inputs`.
  pub fn add_drv_with_inputs(&self, name: &str, outputs: &[&str], inputs: &[(&StorePath, &str)]) -> StorePath {
    let mut drv = test_derivation(name, outputs, DerivationOutput::Deferred);
    for (input, output) in inputs {
      drv
        .input_drvs
        .entry((*input).clone())
        .or_default()
        .insert(output.to_string());
    }
    drv.fill_input_addressed_paths(&*self.store).unwrap();
    self.store.write_derivation(&drv).unwrap()
  }

  /// Write a floating content-addressed derivation.
  pub fn add_ca_drv(&self, name: &str, outputs: &[&str]) -> StorePath {
    let drv = test_derivation(
      name,
      outputs,
      DerivationOutput::CaFloating {
        hash_algo: "sha256".to_string(),
      },
    );
    self.store.write_derivation(&drv).unwrap()
  }

  pub fn static_output(&self, drv_path: &StorePath, output: &str) -> StorePath {
    let drv = self.store.read_derivation(drv_path).unwrap();
    drv.outputs[output].static_path().unwrap().clone()
  }
}

pub fn test_derivation(name: &str, outputs: &[&str], output: DerivationOutput) -> Derivation {
  Derivation {
    name: name.to_string(),
    system: "x86_64-linux".to_string(),
    builder: "/bin/sh".to_string(),
    args: Vec::new(),
    env: BTreeMap::new(),
    input_drvs: BTreeMap::new(),
    input_srcs: BTreeSet::new(),
    outputs: outputs.iter().map(|o| (o.to_string(), output.clone())).collect(),
  }
}

/// Make `path` valid by creating it.
pub fn write_output(store: &LocalStore, path: &StorePath) {
  fs::write(store.store_dir().to_path(path), "output").unwrap();
}
