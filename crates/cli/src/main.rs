mod args;
mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use realise_lib::settings::Settings;

use crate::args::InstallablesArgs;
use crate::cmd::{cmd_build, cmd_eval, cmd_path_info};

/// realise - resolve installables and realise their outputs
#[derive(Parser)]
#[command(name = "realise")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Root directory of the store
  #[arg(long, global = true, value_name = "DIR")]
  store: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build installables and print their output paths
  Build {
    #[command(flatten)]
    installables: InstallablesArgs,

    /// Show what would be built without building anything
    #[arg(long)]
    dry_run: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Print the store paths installables refer to, without building
  PathInfo {
    #[command(flatten)]
    installables: InstallablesArgs,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Evaluate an installable and print its value as JSON
  Eval {
    #[command(flatten)]
    installables: InstallablesArgs,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let mut settings = Settings::from_env();
  if let Some(store) = cli.store {
    settings.store_root = store;
  }

  match cli.command {
    Commands::Build {
      installables,
      dry_run,
      json,
    } => cmd_build(settings, &installables, dry_run, json),
    Commands::PathInfo { installables, json } => cmd_path_info(settings, &installables, json),
    Commands::Eval { installables } => cmd_eval(settings, &installables),
  }
}
