//! Flags shared by every command that takes installables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use realise_lib::eval::AutoArgs;
use realise_lib::flake::{FlakeRef, InputPath, LockFlags};
use realise_lib::installable::InstallableOptions;

#[derive(Debug, Clone, Args)]
pub struct LockArgs {
  /// Ignore the existing lock file and lock every input again
  #[arg(long)]
  pub recreate_lock_file: bool,

  /// Fail instead of changing the lock file
  #[arg(long)]
  pub no_update_lock_file: bool,

  /// Do not write a changed lock file
  #[arg(long)]
  pub no_write_lock_file: bool,

  /// Do not resolve indirect flake references through the registry
  #[arg(long)]
  pub no_registries: bool,

  /// Commit changes to the lock file
  #[arg(long)]
  pub commit_lock_file: bool,

  /// Lock this input again even if the lock file has it
  #[arg(long, value_name = "INPUT_PATH")]
  pub update_input: Vec<String>,

  /// Pin an input to a flake reference
  #[arg(long, num_args = 2, value_names = ["INPUT_PATH", "FLAKE_REF"])]
  pub override_input: Vec<String>,

  /// Use the inputs of this flake as registry entries
  #[arg(long, value_name = "FLAKE_REF")]
  pub inputs_from: Option<String>,
}

impl LockArgs {
  pub fn to_lock_flags(&self, base_dir: &Path) -> Result<LockFlags> {
    let mut flags = LockFlags {
      recreate_lock_file: self.recreate_lock_file,
      update_lock_file: !self.no_update_lock_file,
      write_lock_file: !self.no_write_lock_file,
      use_registries: !self.no_registries,
      commit_lock_file: self.commit_lock_file,
      ..LockFlags::default()
    };

    for input in &self.update_input {
      let path: InputPath = input
        .parse()
        .with_context(|| format!("Invalid input path: {}", input))?;
      flags.input_updates.insert(path);
    }

    for pair in self.override_input.chunks(2) {
      let [input, flake_ref] = pair else {
        anyhow::bail!("--override-input takes an input path and a flake reference");
      };
      let path: InputPath = input
        .parse()
        .with_context(|| format!("Invalid input path: {}", input))?;
      let flake_ref =
        FlakeRef::parse(flake_ref, base_dir).with_context(|| format!("Invalid flake reference: {}", flake_ref))?;
      flags.override_input(path, flake_ref);
    }

    Ok(flags)
  }
}

#[derive(Debug, Clone, Args)]
pub struct InstallablesArgs {
  /// Interpret installables as attribute paths into this file
  #[arg(short, long, value_name = "FILE")]
  pub file: Option<PathBuf>,

  /// Interpret installables as attribute paths into this expression
  #[arg(long, value_name = "EXPR")]
  pub expr: Option<String>,

  /// Pass a string argument to functions that are called automatically
  #[arg(long, num_args = 2, value_names = ["NAME", "VALUE"])]
  pub argstr: Vec<String>,

  /// Operate on the derivations instead of their outputs
  #[arg(long)]
  pub derivation: bool,

  #[command(flatten)]
  pub lock: LockArgs,

  /// Store paths, flake references or attribute paths (default: ".")
  pub installables: Vec<String>,
}

impl InstallablesArgs {
  pub fn to_options(&self, base_dir: &Path) -> Result<InstallableOptions> {
    let mut auto_args = AutoArgs::new();
    for pair in self.argstr.chunks(2) {
      if let [name, value] = pair {
        auto_args.insert(name.clone(), value.clone());
      }
    }

    Ok(InstallableOptions {
      file: self.file.clone(),
      expr: self.expr.clone(),
      auto_args,
      lock_flags: self.lock.to_lock_flags(base_dir)?,
      inputs_from: self.lock.inputs_from.clone(),
    })
  }

  /// The installables given, or `.` when there are none.
  pub fn raw_installables(&self) -> Vec<String> {
    if self.installables.is_empty() {
      vec![".".to_string()]
    } else {
      self.installables.clone()
    }
  }
}
