//! Implementation of the `realise eval` command.

use anyhow::{Context, Result};

use realise_lib::settings::Settings;

use crate::args::InstallablesArgs;
use crate::cmd::Session;
use crate::output::print_json;

pub fn cmd_eval(settings: Settings, args: &InstallablesArgs) -> Result<()> {
  let session = Session::open(settings, args)?;
  let Some(installable) = session.installables.first() else {
    anyhow::bail!("no installable to evaluate");
  };
  if session.installables.len() > 1 {
    anyhow::bail!("'eval' takes a single installable");
  }

  let (value, _pos) = installable.to_value()?;
  let json = value
    .to_json()
    .with_context(|| format!("Failed to convert '{}' to JSON", installable.what()))?;
  print_json(&json)
}
