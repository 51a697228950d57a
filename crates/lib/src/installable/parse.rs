use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::eval::{AutoArgs, EvalState};
use crate::flake::{FlakeRef, LockFlags, Registry, parse_flake_ref_with_fragment};
use crate::settings::Settings;

use super::{Installable, InstallableAttrPath, InstallableFlake, InstallableStorePath};

/// Command-line options that shape how installables are parsed.
#[derive(Debug, Clone, Default)]
pub struct InstallableOptions {
  /// Evaluate attribute paths against this file.
  pub file: Option<PathBuf>,
  /// Evaluate attribute paths against this expression.
  pub expr: Option<String>,
  pub auto_args: AutoArgs,
  pub lock_flags: LockFlags,
  /// Register the inputs of this flake as registry overrides.
  pub inputs_from: Option<String>,
}

impl InstallableOptions {
  /// Adjust settings before the evaluator is created. Files may import
  /// anything, so `--file` turns pure evaluation off.
  pub fn adjust_settings(&self, settings: &mut Settings) {
    if self.file.is_some() {
      settings.pure_eval = false;
    }
  }

  /// The registry resolution uses, extended with `--inputs-from`.
  pub fn registry(&self, state: &EvalState, base_dir: &Path) -> Result<Registry> {
    let registry = Registry::load(&state.settings().registry_path)?;
    match &self.inputs_from {
      Some(flake_ref) => {
        let flake_ref = FlakeRef::parse(flake_ref, base_dir)?;
        debug!(flake = %flake_ref, "using inputs as registry entries");
        Ok(registry.apply_inputs_from(state, &flake_ref, &self.lock_flags)?)
      }
      None => Ok(registry),
    }
  }
}

/// Parse each of `args` into an installable, in order.
///
/// With `--file` or `--expr` every argument is an attribute path. Otherwise
/// an argument containing `/` is first tried as a store path, then every
/// argument is parsed as `flake-ref[#fragment]`.
pub fn parse_installables(
  state: &Rc<EvalState>,
  registry: &Rc<Registry>,
  options: &InstallableOptions,
  base_dir: &Path,
  args: &[String],
) -> Result<Vec<Installable>> {
  if options.file.is_some() && options.expr.is_some() {
    return Err(Error::Usage("'--file' and '--expr' are exclusive".to_string()));
  }

  if options.file.is_some() || options.expr.is_some() {
    return parse_attr_paths(state, options, base_dir, args);
  }

  let settings = state.settings();
  let mut res = Vec::with_capacity(args.len());
  for s in args {
    let mut remembered: Option<Error> = None;

    if s.contains('/') {
      match state.store().follow_links_to_store_path(&base_dir.join(s)) {
        Ok(path) => {
          trace!(installable = %s, "parsed as store path");
          res.push(Installable::StorePath(InstallableStorePath::new(state.store().clone(), path)));
          continue;
        }
        Err(e) if e.is_not_a_store_path() => {}
        Err(e) => remembered = Some(e.into()),
      }
    }

    let parsed = parse_flake_ref_with_fragment(s, base_dir)
      .map_err(Error::from)
      .and_then(|(flake_ref, fragment)| {
        let attr_paths = if fragment.is_empty() {
          settings.default_flake_attr_paths()
        } else {
          vec![fragment]
        };
        InstallableFlake::new(
          state.clone(),
          registry.clone(),
          flake_ref,
          attr_paths,
          settings.default_flake_attr_path_prefixes(),
          &options.auto_args,
          options.lock_flags.clone(),
        )
      });

    match parsed {
      Ok(flake) => {
        trace!(installable = %s, "parsed as flake reference");
        res.push(Installable::Flake(flake));
      }
      // A store path that exists but cannot be followed says more than
      // the flake parser does about such an argument.
      Err(e) => return Err(remembered.unwrap_or(e)),
    }
  }

  Ok(res)
}

fn parse_attr_paths(
  state: &Rc<EvalState>,
  options: &InstallableOptions,
  base_dir: &Path,
  args: &[String],
) -> Result<Vec<Installable>> {
  let (root, origin) = match (&options.file, &options.expr) {
    (Some(file), _) => {
      let file = base_dir.join(file);
      (state.eval_file(&file)?, file.display().to_string())
    }
    (None, Some(expr)) => (state.eval_expr(expr, base_dir)?, "«string»".to_string()),
    (None, None) => return Err(Error::Internal("no expression source".to_string())),
  };

  let auto_args = Rc::new(options.auto_args.clone());
  Ok(
    args
      .iter()
      .map(|s| {
        let attr_path = if s == "." { String::new() } else { s.clone() };
        Installable::AttrPath(InstallableAttrPath::new(
          state.clone(),
          root.clone(),
          origin.clone(),
          attr_path,
          auto_args.clone(),
        ))
      })
      .collect(),
  )
}
