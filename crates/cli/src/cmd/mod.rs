mod build;
mod eval;
mod path_info;

use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::debug;

use realise_lib::derived_path::OperateOn;
use realise_lib::eval::EvalState;
use realise_lib::installable::{Installable, parse_installables};
use realise_lib::settings::Settings;
use realise_lib::store::{LocalStore, Store, StorePath};

use crate::args::InstallablesArgs;

pub use build::cmd_build;
pub use eval::cmd_eval;
pub use path_info::cmd_path_info;

/// The store, evaluator and parsed installables of one invocation.
pub struct Session {
  pub store: Rc<LocalStore>,
  pub state: Rc<EvalState>,
  pub installables: Vec<Installable>,
  pub operate_on: OperateOn,
}

impl Session {
  pub fn open(mut settings: Settings, args: &InstallablesArgs) -> Result<Self> {
    let base_dir = std::env::current_dir().context("Failed to get current directory")?;
    let options = args.to_options(&base_dir)?;
    options.adjust_settings(&mut settings);

    let store = Rc::new(
      LocalStore::from_settings(&settings)
        .with_context(|| format!("Failed to open store at {}", settings.store_root.display()))?,
    );
    let state = Rc::new(EvalState::new(settings, store.clone()).context("Failed to create evaluator")?);

    let registry = Rc::new(
      options
        .registry(&state, &base_dir)
        .context("Failed to load flake registry")?,
    );
    let installables = parse_installables(&state, &registry, &options, &base_dir, &args.raw_installables())?;
    debug!(count = installables.len(), derivation = args.derivation, "parsed installables");

    Ok(Self {
      store,
      state,
      installables,
      operate_on: if args.derivation {
        OperateOn::Derivation
      } else {
        OperateOn::Output
      },
    })
  }

  pub fn settings(&self) -> &Settings {
    self.state.settings()
  }

  pub fn print_path(&self, path: &StorePath) -> String {
    self.store.store_dir().print(path)
  }
}
