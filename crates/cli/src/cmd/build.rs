//! Implementation of the `realise build` command.
//!
//! Installables are resolved into build requests which are realised in the
//! store. With `--dry-run` the store is left read-only and only what would
//! be built is reported.

use anyhow::{Context, Result};

use realise_lib::derived_path::{OperateOn, RealiseMode};
use realise_lib::realise::{realise, resolve_to_requests, to_output_paths};
use realise_lib::settings::Settings;
use realise_lib::store::{BuildMode, Store};

use crate::args::InstallablesArgs;
use crate::cmd::Session;
use crate::output::{print_info, print_item, print_json, print_warning};

pub fn cmd_build(settings: Settings, args: &InstallablesArgs, dry_run: bool, json: bool) -> Result<()> {
  let session = Session::open(settings, args)?;
  let store = session.store.as_ref();
  let mode = if dry_run {
    RealiseMode::DryRun
  } else {
    RealiseMode::FullOutputs
  };

  let built = match session.operate_on {
    OperateOn::Derivation => to_output_paths(
      store,
      session.settings(),
      &session.installables,
      mode,
      OperateOn::Derivation,
    )?,
    OperateOn::Output => {
      let requests = resolve_to_requests(&session.installables)?;

      if dry_run && !json {
        let missing = store.query_missing(&requests).context("Failed to query missing paths")?;
        if missing.is_empty() {
          print_info("Nothing to build");
        }
        if !missing.will_build.is_empty() {
          print_info(&format!("{} derivation(s) will be built:", missing.will_build.len()));
          for drv in &missing.will_build {
            print_item(&session.print_path(drv));
          }
        }
        if !missing.unknown.is_empty() {
          print_warning(&format!("{} path(s) are missing and cannot be built:", missing.unknown.len()));
          for path in &missing.unknown {
            print_item(&session.print_path(path));
          }
        }
      }

      realise(store, session.settings(), &requests, mode, BuildMode::Normal)?
    }
  };

  if json {
    let store_dir = store.store_dir();
    let entries: Vec<serde_json::Value> = built.iter().map(|b| b.to_json(store_dir)).collect();
    return print_json(&entries);
  }

  if !dry_run {
    for path in built.iter().flat_map(|b| b.out_paths()) {
      println!("{}", session.print_path(&path));
    }
  }

  Ok(())
}
