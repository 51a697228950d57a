//! The `builtins` global.
//!
//! - `builtins.storeDir`: the store directory
//! - `builtins.currentSystem`: only outside pure evaluation
//! - `builtins.getEnv(name)`: empty in pure evaluation
//! - `builtins.toFile(name, contents)`: write a text file to the store
//! - `builtins.derivation{...}`: write a derivation and return its value

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::debug;

use crate::consts::DEFAULT_OUTPUT;
use crate::settings::{ExperimentalFeature, Settings};
use crate::store::{Derivation, DerivationOutput, Store, StorePath};
use crate::util::hash::hash_bytes;

/// Attributes of a derivation call that do not become environment variables.
const NON_ENV_ATTRS: &[&str] = &["args", "__contentAddressed"];

pub fn register(lua: &Lua, settings: &Settings, store: Rc<dyn Store>) -> LuaResult<()> {
  let builtins = lua.create_table()?;

  builtins.set("storeDir", store.store_dir().as_path().to_string_lossy().into_owned())?;
  if !settings.pure_eval {
    builtins.set("currentSystem", settings.system.as_str())?;
  }

  let pure = settings.pure_eval;
  builtins.set(
    "getEnv",
    lua.create_function(move |_, name: String| {
      if pure {
        return Ok(String::new());
      }
      Ok(std::env::var(name).unwrap_or_default())
    })?,
  )?;

  let to_file_store = store.clone();
  builtins.set(
    "toFile",
    lua.create_function(move |_, (name, contents): (String, String)| {
      let path = to_file_store
        .add_text_to_store(&name, &contents)
        .map_err(LuaError::external)?;
      Ok(to_file_store.store_dir().print(&path))
    })?,
  )?;

  let ca_enabled = settings.is_experimental_feature_enabled(ExperimentalFeature::CaDerivations);
  builtins.set(
    "derivation",
    lua.create_function(move |lua, attrs: LuaTable| derivation(lua, store.as_ref(), ca_enabled, attrs))?,
  )?;

  lua.globals().set("builtins", builtins)?;
  Ok(())
}

fn required_string(attrs: &LuaTable, name: &str) -> LuaResult<String> {
  attrs
    .get::<Option<String>>(name)?
    .ok_or_else(|| LuaError::external(format!("required attribute '{}' missing", name)))
}

/// Output names in declaration order, `out` when none are declared.
fn declared_outputs(attrs: &LuaTable) -> LuaResult<Vec<String>> {
  let Some(outputs) = attrs.get::<Option<Vec<String>>>("outputs")? else {
    return Ok(vec![DEFAULT_OUTPUT.to_string()]);
  };
  if outputs.is_empty() {
    return Err(LuaError::external("derivation must have at least one output"));
  }
  let mut seen = BTreeSet::new();
  for name in &outputs {
    if !seen.insert(name) {
      return Err(LuaError::external(format!("duplicate derivation output '{}'", name)));
    }
  }
  Ok(outputs)
}

/// Turn one attribute into an environment string, recording store
/// references it carries.
fn coerce_env(value: LuaValue, store: &dyn Store, drv: &mut Derivation) -> LuaResult<Option<String>> {
  Ok(Some(match value {
    LuaValue::Nil => return Ok(None),
    LuaValue::Boolean(true) => "1".to_string(),
    LuaValue::Boolean(false) => String::new(),
    LuaValue::Integer(i) => i.to_string(),
    LuaValue::Number(n) => n.to_string(),
    LuaValue::String(s) => {
      let s = s.to_string_lossy();
      if let Some(path) = store.store_dir().maybe_parse(&s)
        && !path.is_derivation()
      {
        drv.input_srcs.insert(path);
      }
      s
    }
    LuaValue::Table(t) if is_derivation_table(&t) => derivation_reference(&t, store, drv)?,
    LuaValue::Table(t) => {
      let mut parts = Vec::new();
      for item in t.sequence_values::<LuaValue>() {
        if let Some(part) = coerce_env(item?, store, drv)? {
          parts.push(part);
        }
      }
      parts.join(" ")
    }
    other => {
      return Err(LuaError::external(format!(
        "cannot coerce {} to a string",
        other.type_name()
      )));
    }
  }))
}

fn is_derivation_table(t: &LuaTable) -> bool {
  matches!(t.get::<Option<String>>("type"), Ok(Some(ty)) if ty == "derivation")
}

/// Record a dependency on another derivation's output and return the
/// string it stands for.
fn derivation_reference(t: &LuaTable, store: &dyn Store, drv: &mut Derivation) -> LuaResult<String> {
  let drv_path: String = t.get("drvPath")?;
  let output_name: String = t.get("outputName")?;
  let input = store
    .store_dir()
    .parse(Path::new(&drv_path))
    .map_err(LuaError::external)?;
  drv
    .input_drvs
    .entry(input)
    .or_default()
    .insert(output_name.clone());
  Ok(match t.get::<Option<String>>("outPath")? {
    Some(out_path) => out_path,
    None => upstream_placeholder(&drv_path, &output_name),
  })
}

/// Stand-in for an output path that is only known after building.
fn upstream_placeholder(drv_path: &str, output_name: &str) -> String {
  format!("/{}", hash_bytes(format!("upstream-output:{}:{}", drv_path, output_name).as_bytes()).0)
}

fn derivation(lua: &Lua, store: &dyn Store, ca_enabled: bool, attrs: LuaTable) -> LuaResult<LuaTable> {
  let name = required_string(&attrs, "name")?;
  let system = required_string(&attrs, "system")?;
  let builder = required_string(&attrs, "builder")?;
  let outputs = declared_outputs(&attrs)?;
  let content_addressed = attrs.get::<Option<bool>>("__contentAddressed")?.unwrap_or(false);
  let output_hash = attrs.get::<Option<String>>("outputHash")?;

  if content_addressed && !ca_enabled {
    return Err(LuaError::external(format!(
      "experimental feature '{}' is disabled",
      ExperimentalFeature::CaDerivations
    )));
  }
  if output_hash.is_some() && outputs != [DEFAULT_OUTPUT] {
    return Err(LuaError::external("fixed-output derivations must have a single 'out' output"));
  }

  let mut drv = Derivation {
    name: name.clone(),
    system: system.clone(),
    builder,
    args: Vec::new(),
    env: BTreeMap::new(),
    input_drvs: BTreeMap::new(),
    input_srcs: BTreeSet::new(),
    outputs: BTreeMap::new(),
  };

  if let Some(args) = attrs.get::<Option<LuaTable>>("args")? {
    for arg in args.sequence_values::<LuaValue>() {
      if let Some(arg) = coerce_env(arg?, store, &mut drv)? {
        drv.args.push(arg);
      }
    }
  }

  for pair in attrs.pairs::<String, LuaValue>() {
    let (key, value) = pair?;
    if NON_ENV_ATTRS.contains(&key.as_str()) {
      continue;
    }
    let value = if key == "outputs" {
      Some(outputs.join(" "))
    } else {
      coerce_env(value, store, &mut drv)?
    };
    if let Some(value) = value {
      drv.env.insert(key, value);
    }
  }

  for output_name in &outputs {
    let output = match &output_hash {
      Some(hash) => DerivationOutput::CaFixed {
        hash: hash.clone(),
        path: store
          .store_dir()
          .make_fixed_output_path(hash, &name)
          .map_err(LuaError::external)?,
      },
      None if content_addressed => DerivationOutput::CaFloating {
        hash_algo: "sha256".to_string(),
      },
      None => DerivationOutput::Deferred,
    };
    drv.outputs.insert(output_name.clone(), output);
    drv.env.insert(output_name.clone(), String::new());
  }

  drv.fill_input_addressed_paths(store).map_err(LuaError::external)?;

  let store_dir = store.store_dir();
  let out_paths: BTreeMap<String, Option<StorePath>> = drv.outputs_and_opt_paths();
  for (output_name, path) in &out_paths {
    let value = match path {
      Some(path) => store_dir.print(path),
      None => upstream_placeholder(&format!("{}.drv", name), output_name),
    };
    drv.env.insert(output_name.clone(), value);
  }

  let drv_path = store.write_derivation(&drv).map_err(LuaError::external)?;
  let drv_path_str = store_dir.print(&drv_path);
  debug!(drv = %drv_path_str, "instantiated derivation");

  let output_list = lua.create_sequence_from(outputs.iter().map(String::as_str))?;
  let mut tables = Vec::with_capacity(outputs.len());
  for output_name in &outputs {
    let t = lua.create_table()?;
    t.set("type", "derivation")?;
    t.set("name", name.as_str())?;
    t.set("system", system.as_str())?;
    t.set("drvPath", drv_path_str.as_str())?;
    t.set("outputName", output_name.as_str())?;
    t.set("outputs", output_list.clone())?;
    if let Some(Some(path)) = out_paths.get(output_name) {
      t.set("outPath", store_dir.print(path))?;
    }
    tables.push(t);
  }
  for t in &tables {
    for (output_name, other) in outputs.iter().zip(&tables) {
      t.set(output_name.as_str(), other.clone())?;
    }
  }

  Ok(tables.swap_remove(0))
}
