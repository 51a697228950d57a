//! Lazy values produced by evaluation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use super::{AutoArgs, EvalError};

pub type Attrs = BTreeMap<String, Value>;

/// A value, possibly not yet evaluated.
///
/// Cloning is cheap; aggregates and thunks are shared.
#[derive(Clone)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  String(Rc<str>),
  List(Rc<Vec<Value>>),
  Attrs(Rc<Attrs>),
  Lambda(Rc<Lambda>),
  Thunk(Thunk),
}

impl Value {
  pub fn string(s: impl Into<Rc<str>>) -> Self {
    Self::String(s.into())
  }

  pub fn attrs(attrs: Attrs) -> Self {
    Self::Attrs(Rc::new(attrs))
  }

  /// Defer `f` until the value is forced.
  pub fn thunk(f: impl FnOnce() -> Result<Value, EvalError> + 'static) -> Self {
    Self::Thunk(Thunk(Rc::new(RefCell::new(ThunkState::Pending(Box::new(f))))))
  }

  /// Evaluate to weak head normal form.
  pub fn force(&self) -> Result<Value, EvalError> {
    match self {
      Self::Thunk(thunk) => thunk.force(),
      other => Ok(other.clone()),
    }
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Self::Null => "null",
      Self::Bool(_) => "a Boolean",
      Self::Int(_) => "an integer",
      Self::Float(_) => "a float",
      Self::String(_) => "a string",
      Self::List(_) => "a list",
      Self::Attrs(_) => "a set",
      Self::Lambda(_) => "a function",
      Self::Thunk(_) => "a thunk",
    }
  }

  pub fn as_attrs(&self) -> Option<&Rc<Attrs>> {
    match self {
      Self::Attrs(attrs) => Some(attrs),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::String(s) => Some(s),
      _ => None,
    }
  }

  /// Force and require a string.
  pub fn force_string(&self) -> Result<Rc<str>, EvalError> {
    match self.force()? {
      Self::String(s) => Ok(s),
      other => Err(EvalError::TypeMismatch {
        expected: "a string",
        actual: other.type_name(),
      }),
    }
  }

  /// Force and require an attribute set.
  pub fn force_attrs(&self) -> Result<Rc<Attrs>, EvalError> {
    match self.force()? {
      Self::Attrs(attrs) => Ok(attrs),
      other => Err(EvalError::TypeMismatch {
        expected: "a set",
        actual: other.type_name(),
      }),
    }
  }

  /// An attribute set whose `type` attribute is `"derivation"`.
  pub fn is_derivation(&self) -> Result<bool, EvalError> {
    match self.force()? {
      Self::Attrs(attrs) => is_derivation_attrs(&attrs),
      _ => Ok(false),
    }
  }

  /// Deeply force into JSON. Derivations become their output path.
  pub fn to_json(&self) -> Result<serde_json::Value, EvalError> {
    Ok(match self.force()? {
      Self::Null => serde_json::Value::Null,
      Self::Bool(b) => serde_json::Value::Bool(b),
      Self::Int(i) => serde_json::Value::from(i),
      Self::Float(f) => serde_json::Value::from(f),
      Self::String(s) => serde_json::Value::String(s.to_string()),
      Self::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect::<Result<_, _>>()?),
      Self::Attrs(attrs) => {
        if is_derivation_attrs(&attrs)? {
          let path = attrs.get("outPath").or_else(|| attrs.get("drvPath"));
          return match path {
            Some(path) => Ok(serde_json::Value::String(path.force_string()?.to_string())),
            None => Err(EvalError::CannotConvert {
              what: "a derivation without a path",
            }),
          };
        }
        let mut map = serde_json::Map::new();
        for (name, value) in attrs.iter() {
          map.insert(name.clone(), value.to_json()?);
        }
        serde_json::Value::Object(map)
      }
      Self::Lambda(_) => return Err(EvalError::CannotConvert { what: "a function" }),
      Self::Thunk(_) => unreachable!("force never returns a thunk"),
    })
  }
}

pub(crate) fn is_derivation_attrs(attrs: &Attrs) -> Result<bool, EvalError> {
  match attrs.get("type") {
    Some(ty) => Ok(matches!(ty.force()?, Value::String(s) if &*s == "derivation")),
    None => Ok(false),
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => f.write_str("null"),
      Self::Bool(b) => write!(f, "{}", b),
      Self::Int(i) => write!(f, "{}", i),
      Self::Float(x) => write!(f, "{}", x),
      Self::String(s) => write!(f, "{:?}", s),
      Self::List(items) => f.debug_list().entries(items.iter()).finish(),
      Self::Attrs(attrs) => f.debug_set().entries(attrs.keys()).finish(),
      Self::Lambda(_) => f.write_str("<lambda>"),
      Self::Thunk(_) => f.write_str("<thunk>"),
    }
  }
}

/// The arguments a function accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formals {
  /// Accepts any arguments.
  Open,
  /// Declared argument names, each flagged with whether it has a default.
  Named(BTreeMap<String, bool>),
}

type LambdaFn = dyn Fn(&AutoArgs) -> Result<Value, EvalError>;

pub struct Lambda {
  pub formals: Formals,
  func: Box<LambdaFn>,
}

impl Lambda {
  pub fn new(formals: Formals, func: impl Fn(&AutoArgs) -> Result<Value, EvalError> + 'static) -> Self {
    Self {
      formals,
      func: Box::new(func),
    }
  }

  pub fn call(&self, args: &AutoArgs) -> Result<Value, EvalError> {
    (self.func)(args)
  }
}

type PendingFn = Box<dyn FnOnce() -> Result<Value, EvalError>>;

enum ThunkState {
  Pending(PendingFn),
  /// Being forced; forcing again means the value depends on itself.
  Forcing,
  Done(Value),
  Failed(EvalError),
}

#[derive(Clone)]
pub struct Thunk(Rc<RefCell<ThunkState>>);

impl Thunk {
  fn force(&self) -> Result<Value, EvalError> {
    let state = std::mem::replace(&mut *self.0.borrow_mut(), ThunkState::Forcing);
    match state {
      ThunkState::Done(value) => {
        *self.0.borrow_mut() = ThunkState::Done(value.clone());
        Ok(value)
      }
      ThunkState::Failed(err) => {
        *self.0.borrow_mut() = ThunkState::Failed(err.clone());
        Err(err)
      }
      ThunkState::Forcing => Err(EvalError::InfiniteRecursion),
      ThunkState::Pending(f) => {
        let result = f().and_then(|value| value.force());
        *self.0.borrow_mut() = match &result {
          Ok(value) => ThunkState::Done(value.clone()),
          Err(err) => ThunkState::Failed(err.clone()),
        };
        result
      }
    }
  }
}
