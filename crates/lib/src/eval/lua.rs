//! Conversion from Lua values and chunk loading.
//!
//! Tables become attribute sets (or lists, for sequences) whose members are
//! converted only when forced, so cyclic tables are fine. Lua functions
//! become lambdas with open formals; a table with a `__functor` function is
//! a lambda too, with formals declared by an optional `__formals` table.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;

use super::value::{Attrs, Formals, Lambda, Value};
use super::{AutoArgs, EvalError};

/// Convert a Lua value. Aggregate members are converted lazily.
pub fn from_lua(lua: &Lua, value: LuaValue) -> Result<Value, EvalError> {
  Ok(match value {
    LuaValue::Nil => Value::Null,
    LuaValue::Boolean(b) => Value::Bool(b),
    LuaValue::Integer(i) => Value::Int(i),
    LuaValue::Number(n) => Value::Float(n),
    LuaValue::String(s) => Value::string(s.to_string_lossy()),
    LuaValue::Function(f) => Value::Lambda(Rc::new(lambda_from_function(lua, f, None, Formals::Open))),
    LuaValue::Table(t) => table_to_value(lua, t)?,
    other => {
      return Err(EvalError::CannotConvert {
        what: other.type_name(),
      });
    }
  })
}

fn table_to_value(lua: &Lua, table: LuaTable) -> Result<Value, EvalError> {
  if let LuaValue::Function(functor) = table.raw_get::<LuaValue>("__functor")? {
    let formals = match table.raw_get::<Option<LuaTable>>("__formals")? {
      Some(formals) => Formals::Named(parse_formals(&formals)?),
      None => Formals::Open,
    };
    return Ok(Value::Lambda(Rc::new(lambda_from_function(lua, functor, Some(table), formals))));
  }

  if is_sequence(&table)? {
    let mut items = Vec::new();
    for item in table.sequence_values::<LuaValue>() {
      items.push(lazy(lua, item?));
    }
    return Ok(Value::List(Rc::new(items)));
  }

  let mut attrs = Attrs::new();
  for pair in table.pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair?;
    // Only string keys name attributes.
    if let LuaValue::String(key) = key {
      attrs.insert(key.to_string_lossy(), lazy(lua, value));
    }
  }
  Ok(Value::attrs(attrs))
}

/// Primitives convert immediately, aggregates on demand.
fn lazy(lua: &Lua, value: LuaValue) -> Value {
  match value {
    LuaValue::Table(_) | LuaValue::Function(_) => {
      let lua = lua.clone();
      Value::thunk(move || from_lua(&lua, value))
    }
    other => from_lua(lua, other).unwrap_or_else(|e| Value::thunk(move || Err(e))),
  }
}

fn is_sequence(table: &LuaTable) -> Result<bool, EvalError> {
  let len = table.raw_len();
  if len == 0 {
    return Ok(false);
  }
  let mut count = 0usize;
  for pair in table.clone().pairs::<LuaValue, LuaValue>() {
    pair?;
    count += 1;
  }
  Ok(count == len)
}

/// `{ "a", "b" }` declares required formals, `{ a = false, b = true }`
/// flags which ones have defaults.
fn parse_formals(table: &LuaTable) -> Result<BTreeMap<String, bool>, EvalError> {
  let mut formals = BTreeMap::new();
  for pair in table.clone().pairs::<LuaValue, LuaValue>() {
    match pair? {
      (LuaValue::Integer(_), LuaValue::String(name)) => {
        formals.insert(name.to_string_lossy(), false);
      }
      (LuaValue::String(name), LuaValue::Boolean(has_default)) => {
        formals.insert(name.to_string_lossy(), has_default);
      }
      _ => {
        return Err(EvalError::CannotConvert {
          what: "a malformed __formals table",
        });
      }
    }
  }
  Ok(formals)
}

fn lambda_from_function(lua: &Lua, func: LuaFunction, functor_self: Option<LuaTable>, formals: Formals) -> Lambda {
  let lua = lua.clone();
  Lambda::new(formals, move |args: &AutoArgs| {
    let table = lua.create_table()?;
    for (name, value) in args {
      table.set(name.as_str(), value.as_str())?;
    }
    let result: LuaValue = match &functor_self {
      Some(this) => func.call((this.clone(), table))?,
      None => func.call(table)?,
    };
    from_lua(&lua, result)
  })
}

/// Build an environment table exposing `__dir` and falling back to globals.
fn chunk_env(lua: &Lua, dir: &Path) -> LuaResult<LuaTable> {
  let env = lua.create_table()?;
  env.set("__dir", dir.to_string_lossy().into_owned())?;

  let mt = lua.create_table()?;
  mt.set("__index", lua.globals())?;
  env.set_metatable(Some(mt))?;
  Ok(env)
}

/// Evaluate a Lua file with `__dir` set to its directory.
pub fn load_file_with_dir(lua: &Lua, path: &Path) -> Result<LuaValue, EvalError> {
  let canonical = dunce::canonicalize(path).map_err(|e| EvalError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;
  let content = fs::read_to_string(&canonical).map_err(|e| EvalError::ReadFile {
    path: canonical.display().to_string(),
    message: e.to_string(),
  })?;
  let dir = canonical.parent().unwrap_or(Path::new("."));

  Ok(
    lua
      .load(&content)
      .set_name(format!("@{}", canonical.display()))
      .set_environment(chunk_env(lua, dir)?)
      .eval::<LuaValue>()?,
  )
}

/// Evaluate an expression string. A bare expression is tried first, then
/// the text as a chunk with its own `return`.
pub fn load_expr_with_dir(lua: &Lua, expr: &str, dir: &Path) -> Result<LuaValue, EvalError> {
  let as_expression = lua
    .load(format!("return {}", expr))
    .set_name("=«string»")
    .set_environment(chunk_env(lua, dir)?)
    .into_function();

  let func = match as_expression {
    Ok(func) => func,
    Err(_) => lua
      .load(expr)
      .set_name("=«string»")
      .set_environment(chunk_env(lua, dir)?)
      .into_function()?,
  };
  Ok(func.call::<LuaValue>(())?)
}
