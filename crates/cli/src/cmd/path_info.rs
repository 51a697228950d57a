//! Implementation of the `realise path-info` command.
//!
//! Prints the store paths installables refer to. Nothing is built: paths
//! that are not yet valid are reported as such.

use anyhow::Result;
use serde::Serialize;

use realise_lib::derived_path::RealiseMode;
use realise_lib::realise::flatten_to_path_set;
use realise_lib::settings::Settings;
use realise_lib::store::Store;

use crate::args::InstallablesArgs;
use crate::cmd::Session;
use crate::output::print_json;

#[derive(Serialize)]
struct PathInfo {
  path: String,
  valid: bool,
}

pub fn cmd_path_info(settings: Settings, args: &InstallablesArgs, json: bool) -> Result<()> {
  let session = Session::open(settings, args)?;
  let store = session.store.as_ref();

  let paths = flatten_to_path_set(
    store,
    session.settings(),
    &session.installables,
    RealiseMode::DerivationOnly,
    session.operate_on,
  )?;

  if json {
    let infos = paths
      .iter()
      .map(|path| {
        Ok(PathInfo {
          path: session.print_path(path),
          valid: store.is_valid_path(path)?,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    return print_json(&infos);
  }

  for path in &paths {
    println!("{}", session.print_path(path));
  }
  Ok(())
}
