//! Shared fixtures for integration tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use tempfile::TempDir;

use realise_lib::eval::EvalState;
use realise_lib::flake::Registry;
use realise_lib::installable::{Installable, InstallableOptions, parse_installables};
use realise_lib::settings::{ExperimentalFeature, Settings};
use realise_lib::store::{BuildMode, Derivation, LocalStore, StoreDir, StoreError, StorePath, output_path_name};

pub const SYSTEM: &str = "x86_64-linux";

/// `hello` has two outputs; `greeting` depends on its `dev` output.
pub const HELLO_FLAKE: &str = r#"
return {
  description = "hello",
  outputs = function(inputs)
    local function drv(args)
      args.system = 'x86_64-linux'
      args.builder = '/bin/sh'
      return builtins.derivation(args)
    end
    local hello = drv { name = 'hello', outputs = { 'out', 'dev' } }
    return {
      packages = {
        ['x86_64-linux'] = {
          hello = hello,
          default = hello,
          greeting = drv { name = 'greeting', headers = hello.dev },
        },
      },
      lib = { version = '1.0' },
    }
  end,
}
"#;

pub const CA_FLAKE: &str = r#"
return {
  outputs = function(inputs)
    local ca = builtins.derivation {
      name = 'ca', system = 'x86_64-linux', builder = '/bin/sh', __contentAddressed = true,
    }
    return { packages = { ['x86_64-linux'] = { default = ca } } }
  end,
}
"#;

/// An isolated store and evaluator rooted in a temporary directory.
pub struct TestEnv {
  pub temp: TempDir,
  pub store: Rc<LocalStore>,
  pub state: Rc<EvalState>,
}

impl TestEnv {
  /// An environment whose store cannot build anything.
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let settings = settings_in(&temp);
    let store = Rc::new(LocalStore::open(&settings.store_root).unwrap());
    Self::with_store(temp, settings, store)
  }

  /// An environment whose store builds with [`write_outputs`].
  pub fn building() -> Self {
    Self::building_with(|_| {})
  }

  pub fn building_with(configure: impl FnOnce(&mut Settings)) -> Self {
    let temp = TempDir::new().unwrap();
    let mut settings = settings_in(&temp);
    configure(&mut settings);
    let store = Rc::new(LocalStore::open(&settings.store_root).unwrap().with_build_hook(write_outputs));
    Self::with_store(temp, settings, store)
  }

  /// An environment with content-addressed derivations enabled.
  pub fn content_addressed() -> Self {
    Self::building_with(|settings| {
      settings
        .experimental_features
        .insert(ExperimentalFeature::CaDerivations);
    })
  }

  fn with_store(temp: TempDir, settings: Settings, store: Rc<LocalStore>) -> Self {
    let state = Rc::new(EvalState::new(settings, store.clone()).unwrap());
    Self { temp, store, state }
  }

  /// A second evaluator over the same store and cache.
  pub fn reopen(&self, configure: impl FnOnce(&mut Settings)) -> Rc<EvalState> {
    let mut settings = self.state.settings().clone();
    configure(&mut settings);
    Rc::new(EvalState::new(settings, self.store.clone()).unwrap())
  }

  pub fn settings(&self) -> &Settings {
    self.state.settings()
  }

  /// Write `source` as the flake in directory `name`.
  pub fn write_flake(&self, name: &str, source: &str) -> PathBuf {
    let dir = self.temp.path().join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("flake.lua"), source).unwrap();
    dunce::canonicalize(dir).unwrap()
  }

  pub fn parse(&self, args: &[&str]) -> Vec<Installable> {
    self.parse_with(&self.state, &InstallableOptions::default(), args)
  }

  pub fn parse_with(&self, state: &Rc<EvalState>, options: &InstallableOptions, args: &[&str]) -> Vec<Installable> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    parse_installables(state, &Rc::new(Registry::default()), options, self.temp.path(), &args).unwrap()
  }

  pub fn print(&self, path: &StorePath) -> String {
    use realise_lib::store::Store;
    self.store.store_dir().print(path)
  }
}

fn settings_in(temp: &TempDir) -> Settings {
  Settings {
    system: SYSTEM.to_string(),
    store_root: temp.path().join("root"),
    cache_dir: temp.path().join("cache"),
    registry_path: temp.path().join("registry.json"),
    build_hook: None,
    ..Settings::default()
  }
}

/// A build hook that writes every output of the derivation it is given.
/// Floating outputs get a path derived from the derivation name.
pub fn write_outputs(
  store_dir: &StoreDir,
  _drv_path: &StorePath,
  drv: &Derivation,
  _mode: BuildMode,
) -> Result<BTreeMap<String, StorePath>, StoreError> {
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
}
