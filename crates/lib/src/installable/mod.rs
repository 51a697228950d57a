//! Installables: references to objects that can be built or are built
//! already.
//!
//! An installable is one of
//!
//! - a store path (`/store/...-hello`, or a symlink into the store)
//! - an attribute path into an expression given with `--file` or `--expr`
//! - a flake reference with an optional `#fragment`
//!
//! Each kind turns into build requests ([`DerivedPath`]s) and, where it
//! denotes an evaluated value, into a value or cache cursors.

mod attr;
mod flake;
mod parse;

use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::trace;

pub use attr::InstallableAttrPath;
pub use flake::InstallableFlake;
pub use parse::{InstallableOptions, parse_installables};

use crate::derived_path::{DerivationInfo, DerivedPath};
use crate::error::{Error, Result};
use crate::eval::Value;
use crate::eval_cache::AttrCursor;
use crate::store::{Store, StoreDir, StorePath};

/// Where an installable's value was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pos {
  /// The file, expression or flake the walk started from.
  pub origin: String,
  pub attr_path: String,
}

/// A path already in the store.
#[derive(Clone)]
pub struct InstallableStorePath {
  store: Rc<dyn Store>,
  pub path: StorePath,
}

impl std::fmt::Debug for InstallableStorePath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InstallableStorePath")
      .field("path", &self.path)
      .finish()
  }
}

impl InstallableStorePath {
  pub fn new(store: Rc<dyn Store>, path: StorePath) -> Self {
    Self { store, path }
  }

  pub fn what(&self) -> String {
    self.store.store_dir().print(&self.path)
  }

  /// A derivation stands for all of its outputs; anything else is itself.
  pub fn to_derived_paths(&self) -> Result<Vec<DerivedPath>> {
    if self.path.is_derivation() {
      let drv = self.store.read_derivation(&self.path)?;
      Ok(vec![DerivedPath::Built {
        drv_path: self.path.clone(),
        outputs: drv.output_names(),
      }])
    } else {
      Ok(vec![DerivedPath::Opaque {
        path: self.path.clone(),
      }])
    }
  }
}

#[derive(Debug)]
pub enum Installable {
  StorePath(InstallableStorePath),
  AttrPath(InstallableAttrPath),
  Flake(InstallableFlake),
}

impl Installable {
  /// The installable as the user would write it.
  pub fn what(&self) -> String {
    match self {
      Self::StorePath(i) => i.what(),
      Self::AttrPath(i) => i.what(),
      Self::Flake(i) => i.what(),
    }
  }

  pub fn to_derived_paths(&self) -> Result<Vec<DerivedPath>> {
    match self {
      Self::StorePath(i) => i.to_derived_paths(),
      Self::AttrPath(i) => derivations_to_requests(i.store_dir(), i.to_derivations()?),
      Self::Flake(i) => derivations_to_requests(i.store_dir(), i.to_derivations()?),
    }
  }

  /// The single request this installable stands for.
  pub fn to_derived_path(&self) -> Result<DerivedPath> {
    let mut paths = self.to_derived_paths()?;
    if paths.len() != 1 {
      return Err(Error::Ambiguous {
        installable: self.what(),
        count: paths.len(),
      });
    }
    Ok(paths.remove(0))
  }

  /// The derivations this installable evaluates to. Store paths do not
  /// evaluate and yield none.
  pub fn to_derivations(&self) -> Result<Vec<DerivationInfo>> {
    match self {
      Self::StorePath(_) => Ok(Vec::new()),
      Self::AttrPath(i) => i.to_derivations(),
      Self::Flake(i) => i.to_derivations(),
    }
  }

  pub fn to_value(&self) -> Result<(Value, Pos)> {
    match self {
      Self::StorePath(_) => Err(Error::CannotEvaluate {
        installable: self.what(),
      }),
      Self::AttrPath(i) => i.to_value(),
      Self::Flake(i) => i.to_value(),
    }
  }

  /// Cursors over every place this installable may refer to, in the order
  /// they are tried.
  pub fn get_cursors(&self) -> Result<Vec<Rc<AttrCursor>>> {
    match self {
      Self::StorePath(_) => Err(Error::CannotEvaluate {
        installable: self.what(),
      }),
      Self::AttrPath(i) => Ok(vec![i.get_cursor()]),
      Self::Flake(i) => i.get_cursors(),
    }
  }

  pub fn get_cursor(&self) -> Result<Rc<AttrCursor>> {
    self
      .get_cursors()?
      .into_iter()
      .next()
      .ok_or_else(|| Error::NoFlakeAttribute(self.what()))
  }

  pub fn get_store_path(&self) -> Option<&StorePath> {
    match self {
      Self::StorePath(i) => Some(&i.path),
      _ => None,
    }
  }
}

/// Append `request`, folding the outputs of a `Built` request into an
/// earlier one for the same derivation.
pub(crate) fn push_request(requests: &mut Vec<DerivedPath>, request: DerivedPath) {
  let DerivedPath::Built { drv_path, outputs } = request else {
    requests.push(request);
    return;
  };

  let existing = requests.iter_mut().find_map(|r| match r {
    DerivedPath::Built {
      drv_path: existing,
      outputs: existing_outputs,
    } if *existing == drv_path => Some(existing_outputs),
    _ => None,
  });

  match existing {
    Some(existing_outputs) => existing_outputs.extend(outputs),
    None => requests.push(DerivedPath::Built { drv_path, outputs }),
  }
}

/// One `Built` request per derivation, naming every output asked for.
fn derivations_to_requests(store_dir: &StoreDir, drvs: Vec<DerivationInfo>) -> Result<Vec<DerivedPath>> {
  let mut requests = Vec::new();
  for drv in drvs {
    if drv.output_name.is_empty() {
      return Err(Error::MissingOutputName {
        drv: store_dir.print(&drv.drv_path),
      });
    }
    trace!(drv = %drv.drv_path, output = %drv.output_name, "requesting output");
    push_request(
      &mut requests,
      DerivedPath::Built {
        drv_path: drv.drv_path,
        outputs: BTreeSet::from([drv.output_name]),
      },
    );
  }
  Ok(requests)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{TestStore, write_output};

  fn info(drv_path: &StorePath, output: &str) -> DerivationInfo {
    DerivationInfo {
      drv_path: drv_path.clone(),
      out_path: None,
      output_name: output.to_string(),
    }
  }

  fn built(drv_path: &StorePath, outputs: &[&str]) -> DerivedPath {
    DerivedPath::Built {
      drv_path: drv_path.clone(),
      outputs: outputs.iter().map(|o| o.to_string()).collect(),
    }
  }

  mod store_paths {
    use super::*;

    #[test]
    fn derivation_requests_all_outputs() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out", "dev"]);
      let installable = Installable::StorePath(InstallableStorePath::new(t.store.clone(), drv.clone()));

      assert_eq!(installable.to_derived_paths().unwrap(), vec![built(&drv, &["out", "dev"])]);
      assert_eq!(installable.get_store_path(), Some(&drv));
    }

    #[test]
    fn other_paths_are_opaque() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out"]);
      let out = t.static_output(&drv, "out");
      write_output(&t.store, &out);
      let installable = Installable::StorePath(InstallableStorePath::new(t.store.clone(), out.clone()));

      assert_eq!(
        installable.to_derived_path().unwrap(),
        DerivedPath::Opaque { path: out.clone() }
      );
      assert_eq!(installable.what(), t.store.store_dir().print(&out));
    }

    #[test]
    fn store_paths_cannot_be_evaluated() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out"]);
      let installable = Installable::StorePath(InstallableStorePath::new(t.store.clone(), drv));

      assert!(matches!(installable.to_value().unwrap_err(), Error::CannotEvaluate { .. }));
      assert!(matches!(installable.get_cursor().unwrap_err(), Error::CannotEvaluate { .. }));
      assert!(installable.to_derivations().unwrap().is_empty());
    }
  }

  mod grouping {
    use super::*;

    #[test]
    fn outputs_of_one_derivation_are_merged() {
      let t = TestStore::new();
      let a = t.add_drv("a", &["out", "dev"]);
      let b = t.add_drv("b", &["out"]);

      let requests =
        derivations_to_requests(t.store.store_dir(), vec![info(&a, "out"), info(&b, "out"), info(&a, "dev"), info(&a, "out")])
          .unwrap();
      assert_eq!(requests, vec![built(&a, &["out", "dev"]), built(&b, &["out"])]);
    }

    #[test]
    fn opaque_requests_are_kept_in_order() {
      let t = TestStore::new();
      let a = t.add_drv("a", &["out"]);
      let out = t.static_output(&a, "out");

      let mut requests = Vec::new();
      push_request(&mut requests, DerivedPath::Opaque { path: out.clone() });
      push_request(&mut requests, built(&a, &["out"]));
      push_request(&mut requests, DerivedPath::Opaque { path: out.clone() });

      assert_eq!(requests.len(), 3);
      assert_eq!(requests[2], DerivedPath::Opaque { path: out });
    }

    #[test]
    fn missing_output_name_is_an_error() {
      let t = TestStore::new();
      let a = t.add_drv("a", &["out"]);

      let err = derivations_to_requests(t.store.store_dir(), vec![info(&a, "")]).unwrap_err();
      let Error::MissingOutputName { drv } = &err else {
        panic!("expected a missing output name, got {:?}", err);
      };
      assert_eq!(drv, &t.store.store_dir().print(&a));
      assert!(err.to_string().contains(&t.store.store_dir().print(&a)));
    }
  }
}
