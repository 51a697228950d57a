//! Walking values along dotted attribute paths.

use std::collections::HashSet;
use std::rc::Rc;

use tracing::trace;

use super::value::{Attrs, is_derivation_attrs};
use super::{AutoArgs, EvalError, EvalState, Value};

/// Result of looking up an attribute path.
///
/// `NotFound` is the only outcome that lets a caller move on to another
/// candidate path; every other failure is an `Err`.
#[derive(Debug, Clone)]
pub enum AttrLookup<T> {
  Found(T),
  NotFound {
    /// The missing attribute.
    attr: String,
    /// The path leading up to it.
    prefix: String,
  },
}

impl<T> AttrLookup<T> {
  pub fn found(self) -> Option<T> {
    match self {
      Self::Found(value) => Some(value),
      Self::NotFound { .. } => None,
    }
  }
}

/// Split `a.b."c.d"` into `["a", "b", "c.d"]`.
///
/// A trailing `.` is tolerated and yields no extra component; empty
/// components in the middle are kept so the walker can reject them.
pub fn parse_attr_path(s: &str) -> Result<Vec<String>, EvalError> {
  let mut res = Vec::new();
  let mut cur = String::new();
  let mut chars = s.chars();

  while let Some(c) = chars.next() {
    match c {
      '.' => res.push(std::mem::take(&mut cur)),
      '"' => loop {
        match chars.next() {
          Some('"') => break,
          Some(c) => cur.push(c),
          None => {
            return Err(EvalError::UnterminatedQuote {
              attr_path: s.to_string(),
            });
          }
        }
      },
      c => cur.push(c),
    }
  }

  if !cur.is_empty() {
    res.push(cur);
  }
  Ok(res)
}

/// Descend from `root` along `attr_path`.
///
/// Functions met along the way, including the final value, are auto-called
/// with `auto_args`. Numeric components index lists.
pub fn find_along_attr_path(
  state: &EvalState,
  attr_path: &str,
  auto_args: &AutoArgs,
  root: &Value,
) -> Result<AttrLookup<Value>, EvalError> {
  let tokens = parse_attr_path(attr_path)?;
  let mut v = root.clone();

  for (n, attr) in tokens.iter().enumerate() {
    v = state.auto_call_function(auto_args, &v)?;

    if attr.is_empty() {
      return Err(EvalError::EmptyAttrName {
        attr_path: attr_path.to_string(),
      });
    }

    let prefix = || tokens[..n].join(".");

    if let Ok(index) = attr.parse::<usize>() {
      let Value::List(items) = &v else {
        return Err(EvalError::NotAList {
          attr_path: prefix(),
          actual: v.type_name(),
        });
      };
      v = items
        .get(index)
        .cloned()
        .ok_or_else(|| EvalError::IndexOutOfRange {
          index,
          attr_path: attr_path.to_string(),
        })?;
      continue;
    }

    let Value::Attrs(attrs) = &v else {
      return Err(EvalError::NotAttrs {
        attr_path: prefix(),
        actual: v.type_name(),
      });
    };
    match attrs.get(attr) {
      Some(next) => v = next.clone(),
      None => {
        trace!(attr = %attr, prefix = %prefix(), "attribute not found");
        return Ok(AttrLookup::NotFound {
          attr: attr.clone(),
          prefix: prefix(),
        });
      }
    }
  }

  Ok(AttrLookup::Found(state.auto_call_function(auto_args, &v)?))
}

/// Render candidate paths as `'a', 'b' or 'c'`.
pub fn show_attr_paths(paths: &[String]) -> String {
  let mut s = String::new();
  for (n, path) in paths.iter().enumerate() {
    if n > 0 {
      s += if n + 1 == paths.len() { " or " } else { ", " };
    }
    s.push('\'');
    s += path;
    s.push('\'');
  }
  s
}

/// A derivation-like attribute set found by [`get_derivations`].
#[derive(Debug, Clone)]
pub struct DrvInfo {
  /// Where the derivation was found, relative to the searched value.
  pub attr_path: String,
  attrs: Rc<Attrs>,
}

impl DrvInfo {
  fn string_attr(&self, name: &str) -> Result<Option<String>, EvalError> {
    match self.attrs.get(name) {
      Some(value) => Ok(Some(value.force_string()?.to_string())),
      None => Ok(None),
    }
  }

  pub fn query_name(&self) -> Result<Option<String>, EvalError> {
    self.string_attr("name")
  }

  pub fn query_drv_path(&self) -> Result<String, EvalError> {
    self
      .string_attr("drvPath")?
      .ok_or_else(|| EvalError::MissingAttr {
        attr: "drvPath".to_string(),
      })
  }

  pub fn query_out_path(&self) -> Result<Option<String>, EvalError> {
    self.string_attr("outPath")
  }

  pub fn query_output_name(&self) -> Result<Option<String>, EvalError> {
    self.string_attr("outputName")
  }
}

/// Collect the derivations `value` denotes: the value itself, the elements
/// of a list, or the members of an attribute set. Nested sets are only
/// searched when they set `recurseForDerivations = true`.
pub fn get_derivations(state: &EvalState, value: &Value, auto_args: &AutoArgs) -> Result<Vec<DrvInfo>, EvalError> {
  let mut drvs = Vec::new();
  let mut done = HashSet::new();
  collect_derivations(state, value, "", auto_args, &mut drvs, &mut done)?;
  Ok(drvs)
}

/// Derivations already collected, by derivation path and output.
type Seen = HashSet<(Option<String>, Option<String>)>;

/// Add `value` if it is a derivation not seen yet. Returns whether it was
/// a derivation at all.
fn add_derivation(value: &Value, attr_path: &str, drvs: &mut Vec<DrvInfo>, done: &mut Seen) -> Result<bool, EvalError> {
  let Value::Attrs(attrs) = value.force()? else {
    return Ok(false);
  };
  if !is_derivation_attrs(&attrs)? {
    return Ok(false);
  }

  let info = DrvInfo {
    attr_path: attr_path.to_string(),
    attrs,
  };
  if done.insert((info.string_attr("drvPath")?, info.query_output_name()?)) {
    drvs.push(info);
  }
  Ok(true)
}

fn collect_derivations(
  state: &EvalState,
  value: &Value,
  path_prefix: &str,
  auto_args: &AutoArgs,
  drvs: &mut Vec<DrvInfo>,
  done: &mut Seen,
) -> Result<(), EvalError> {
  let v = state.auto_call_function(auto_args, value)?;

  if add_derivation(&v, path_prefix, drvs, done)? {
    return Ok(());
  }

  let join = |name: &str| {
    if path_prefix.is_empty() {
      name.to_string()
    } else {
      format!("{}.{}", path_prefix, name)
    }
  };

  match &v {
    Value::Attrs(attrs) => {
      for (name, child) in attrs.iter() {
        let child_path = join(name);
        if add_derivation(child, &child_path, drvs, done)? {
          continue;
        }
        if let Value::Attrs(child_attrs) = child.force()?
          && recurses(&child_attrs)?
        {
          collect_derivations(state, child, &child_path, auto_args, drvs, done)?;
        }
      }
      Ok(())
    }
    Value::List(items) => {
      for (n, item) in items.iter().enumerate() {
        let item_path = join(&n.to_string());
        if !add_derivation(item, &item_path, drvs, done)? {
          collect_derivations(state, item, &item_path, auto_args, drvs, done)?;
        }
      }
      Ok(())
    }
    _ => Err(EvalError::NotDerivationLike),
  }
}

fn recurses(attrs: &Attrs) -> Result<bool, EvalError> {
  match attrs.get("recurseForDerivations") {
    Some(flag) => Ok(matches!(flag.force()?, Value::Bool(true))),
    None => Ok(false),
  }
}
