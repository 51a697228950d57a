//! Build orchestration.
//!
//! Installables are flattened into build requests, handed to the store
//! according to a [`RealiseMode`], and resolved into [`BuiltPath`]s.

mod resolve;

use std::collections::BTreeSet;

use tracing::{debug, info};

pub use resolve::get_built_paths;

use crate::derived_path::{BuiltPath, DerivedPath, OperateOn, RealiseMode};
use crate::error::{Error, Result};
use crate::installable::{Installable, push_request};
use crate::settings::Settings;
use crate::store::{BuildMode, Store, StorePath};

/// The requests `installables` stand for, in order. Requests for the same
/// derivation are merged into one naming every wanted output.
pub fn resolve_to_requests(installables: &[Installable]) -> Result<Vec<DerivedPath>> {
  let mut requests = Vec::new();
  for installable in installables {
    for request in installable.to_derived_paths()? {
      push_request(&mut requests, request);
    }
  }
  Ok(requests)
}

/// Hand `requests` to the store as `mode` says, then resolve them.
pub fn realise(
  store: &dyn Store,
  settings: &Settings,
  requests: &[DerivedPath],
  mode: RealiseMode,
  build_mode: BuildMode,
) -> Result<Vec<BuiltPath>> {
  match mode {
    RealiseMode::DryRun => {
      store.set_read_only(true);
      store.print_missing(requests)?;
    }
    RealiseMode::DerivationOnly => {
      store.print_missing(requests)?;
    }
    RealiseMode::FullOutputs => {
      info!(count = requests.len(), mode = build_mode.as_str(), "building");
      store.build_paths(requests, build_mode)?;
    }
  }

  get_built_paths(store, settings, requests)
}

pub fn build(
  store: &dyn Store,
  settings: &Settings,
  installables: &[Installable],
  mode: RealiseMode,
  build_mode: BuildMode,
) -> Result<Vec<BuiltPath>> {
  let requests = resolve_to_requests(installables)?;
  realise(store, settings, &requests, mode, build_mode)
}

/// What `installables` refer to: their outputs, or the derivations that
/// produce them.
pub fn to_output_paths(
  store: &dyn Store,
  settings: &Settings,
  installables: &[Installable],
  mode: RealiseMode,
  operate_on: OperateOn,
) -> Result<Vec<BuiltPath>> {
  match operate_on {
    OperateOn::Output => build(store, settings, installables, mode, BuildMode::Normal),
    OperateOn::Derivation => {
      if mode == RealiseMode::DryRun {
        store.set_read_only(true);
      }
      Ok(
        to_derivations(store, installables, true)?
          .into_iter()
          .map(|path| BuiltPath::Opaque { path })
          .collect(),
      )
    }
  }
}

/// Every store path `installables` refer to.
pub fn flatten_to_path_set(
  store: &dyn Store,
  settings: &Settings,
  installables: &[Installable],
  mode: RealiseMode,
  operate_on: OperateOn,
) -> Result<BTreeSet<StorePath>> {
  Ok(
    to_output_paths(store, settings, installables, mode, operate_on)?
      .iter()
      .flat_map(BuiltPath::out_paths)
      .collect(),
  )
}

/// The store path `installable` refers to, which must be exactly one.
pub fn exactly_one_path(
  store: &dyn Store,
  settings: &Settings,
  installable: &Installable,
  mode: RealiseMode,
  operate_on: OperateOn,
) -> Result<StorePath> {
  let paths = flatten_to_path_set(store, settings, std::slice::from_ref(installable), mode, operate_on)?;
  if paths.len() != 1 {
    return Err(Error::NotOneStorePath {
      installable: installable.what(),
      count: paths.len(),
    });
  }
  paths
    .into_iter()
    .next()
    .ok_or_else(|| Error::Internal("empty path set".to_string()))
}

/// The derivations behind `installables`.
///
/// A path that is not a derivation is replaced by its deriver when
/// `use_deriver` is set; with several known derivers the first is used.
pub fn to_derivations(store: &dyn Store, installables: &[Installable], use_deriver: bool) -> Result<BTreeSet<StorePath>> {
  let mut drv_paths = BTreeSet::new();

  for installable in installables {
    for request in installable.to_derived_paths()? {
      match request {
        DerivedPath::Built { drv_path, .. } => {
          drv_paths.insert(drv_path);
        }
        DerivedPath::Opaque { path } if path.is_derivation() => {
          drv_paths.insert(path);
        }
        DerivedPath::Opaque { path } => {
          if !use_deriver {
            return Err(Error::NotADerivationInstallable {
              installable: installable.what(),
            });
          }
          let Some(deriver) = store.query_valid_derivers(&path)?.into_iter().next() else {
            return Err(Error::NoDeriver {
              installable: installable.what(),
            });
          };
          debug!(path = %path, deriver = %deriver, "using deriver");
          drv_paths.insert(deriver);
        }
      }
    }
  }

  Ok(drv_paths)
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::collections::BTreeMap;
  use std::fs;
  use std::rc::Rc;

  use super::*;
  use crate::eval::AutoArgs;
  use crate::eval::testutil::TestEval;
  use crate::installable::{InstallableAttrPath, InstallableStorePath};
  use crate::store::{Derivation, LocalStore, StoreDir};
  use crate::util::testutil::{TestStore, write_output};

  fn store_path(store: &Rc<LocalStore>, path: &StorePath) -> Installable {
    Installable::StorePath(InstallableStorePath::new(store.clone(), path.clone()))
  }

  fn outputs(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
  }

  mod requests {
    use super::*;

    const HELLO: &str = "{ hello = builtins.derivation { name = 'hello', system = 'x86_64-linux', builder = '/bin/sh', outputs = { 'out', 'dev' } } }";

    fn attr(t: &TestEval, root: &crate::eval::Value, attr_path: &str) -> Installable {
      Installable::AttrPath(InstallableAttrPath::new(
        t.state.clone(),
        root.clone(),
        "«string»".to_string(),
        attr_path.to_string(),
        Rc::new(AutoArgs::new()),
      ))
    }

    #[test]
    fn derivation_store_path_requests_every_output() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out", "dev"]);

      let requests = resolve_to_requests(&[store_path(&t.store, &drv)]).unwrap();
      assert_eq!(
        requests,
        vec![DerivedPath::Built {
          drv_path: drv,
          outputs: outputs(&["out", "dev"]),
        }]
      );
    }

    #[test]
    fn plain_store_path_is_opaque() {
      let t = TestStore::new();
      let path = t.store.add_text_to_store("note", "x").unwrap();

      let requests = resolve_to_requests(&[store_path(&t.store, &path)]).unwrap();
      assert_eq!(requests, vec![DerivedPath::Opaque { path }]);
    }

    #[test]
    fn outputs_of_one_derivation_are_grouped_across_installables() {
      let t = TestEval::new();
      let root = t.eval(HELLO);

      let requests = resolve_to_requests(&[attr(&t, &root, "hello"), attr(&t, &root, "hello.dev")]).unwrap();
      assert_eq!(requests.len(), 1);
      let DerivedPath::Built { outputs: wanted, .. } = &requests[0] else {
        panic!("expected a built request");
      };
      assert_eq!(*wanted, outputs(&["out", "dev"]));
    }

    #[test]
    fn caller_order_is_preserved() {
      let t = TestStore::new();
      let note = t.store.add_text_to_store("note", "x").unwrap();
      let drv = t.add_drv("hello", &["out"]);

      let requests = resolve_to_requests(&[store_path(&t.store, &note), store_path(&t.store, &drv)]).unwrap();
      assert!(matches!(requests[0], DerivedPath::Opaque { .. }));
      assert!(matches!(requests[1], DerivedPath::Built { .. }));
    }
  }

  mod realising {
    use super::*;

    fn counting_store(builds: Rc<Cell<usize>>) -> TestStore {
      TestStore::with_hook(move |store_dir: &StoreDir, _drv_path: &StorePath, drv: &Derivation, _mode| {
        builds.set(builds.get() + 1);
        let mut built = BTreeMap::new();
        for (name, path) in drv.outputs_and_opt_paths() {
          let path = path.expect("input-addressed");
          fs::write(store_dir.to_path(&path), "built").unwrap();
          built.insert(name, path);
        }
        Ok(built)
      })
    }

    #[test]
    fn full_outputs_build_missing_paths() {
      let builds = Rc::new(Cell::new(0));
      let t = counting_store(builds.clone());
      let drv = t.add_drv("hello", &["out"]);

      let res = build(
        &*t.store,
        &Settings::default(),
        &[store_path(&t.store, &drv)],
        RealiseMode::FullOutputs,
        BuildMode::Normal,
      )
      .unwrap();

      assert_eq!(builds.get(), 1);
      let out = t.static_output(&drv, "out");
      assert_eq!(res[0].out_paths(), BTreeSet::from([out.clone()]));
      assert!(t.store.is_valid_path(&out).unwrap());
    }

    #[test]
    fn dry_run_builds_nothing_and_locks_the_store() {
      let builds = Rc::new(Cell::new(0));
      let t = counting_store(builds.clone());
      let drv = t.add_drv("hello", &["out"]);

      let res = build(
        &*t.store,
        &Settings::default(),
        &[store_path(&t.store, &drv)],
        RealiseMode::DryRun,
        BuildMode::Normal,
      )
      .unwrap();

      assert_eq!(builds.get(), 0);
      assert!(t.store.is_read_only());
      let out = t.static_output(&drv, "out");
      assert_eq!(res[0].out_paths(), BTreeSet::from([out.clone()]));
      assert!(!t.store.is_valid_path(&out).unwrap());
    }

    #[test]
    fn derivation_only_reports_without_building() {
      let builds = Rc::new(Cell::new(0));
      let t = counting_store(builds.clone());
      let drv = t.add_drv("hello", &["out"]);

      build(
        &*t.store,
        &Settings::default(),
        &[store_path(&t.store, &drv)],
        RealiseMode::DerivationOnly,
        BuildMode::Normal,
      )
      .unwrap();

      assert_eq!(builds.get(), 0);
      assert!(!t.store.is_read_only());
    }

    #[test]
    fn build_failures_abort() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out"]);

      let err = build(
        &*t.store,
        &Settings::default(),
        &[store_path(&t.store, &drv)],
        RealiseMode::FullOutputs,
        BuildMode::Normal,
      )
      .unwrap_err();
      assert!(matches!(err, Error::Store(_)));
    }
  }

  mod paths {
    use super::*;

    #[test]
    fn duplicate_paths_collapse() {
      let t = TestStore::building();
      let drv = t.add_drv("hello", &["out"]);
      let out = t.static_output(&drv, "out");

      let paths = flatten_to_path_set(
        &*t.store,
        &Settings::default(),
        &[store_path(&t.store, &drv), store_path(&t.store, &drv)],
        RealiseMode::FullOutputs,
        OperateOn::Output,
      )
      .unwrap();
      assert_eq!(paths, BTreeSet::from([out]));
    }

    #[test]
    fn exactly_one_path_accepts_a_single_match() {
      let t = TestStore::building();
      let drv = t.add_drv("hello", &["out"]);

      let path = exactly_one_path(
        &*t.store,
        &Settings::default(),
        &store_path(&t.store, &drv),
        RealiseMode::FullOutputs,
        OperateOn::Output,
      )
      .unwrap();
      assert_eq!(path, t.static_output(&drv, "out"));
    }

    #[test]
    fn exactly_one_path_rejects_two_matches() {
      let t = TestStore::building();
      let drv = t.add_drv("hello", &["out", "dev"]);
      let installable = store_path(&t.store, &drv);

      let err = exactly_one_path(
        &*t.store,
        &Settings::default(),
        &installable,
        RealiseMode::FullOutputs,
        OperateOn::Output,
      )
      .unwrap_err();
      assert!(matches!(err, Error::NotOneStorePath { count: 2, .. }));
      assert_eq!(
        err.to_string(),
        format!(
          "argument '{}' should evaluate to one store path, but evaluated to 2",
          installable.what()
        )
      );
    }
  }

  mod derivers {
    use super::*;

    #[test]
    fn outputs_map_back_to_their_deriver() {
      let t = TestStore::building();
      let drv = t.add_drv("hello", &["out"]);
      let out = t.static_output(&drv, "out");
      t.store
        .build_paths(
          &[DerivedPath::Built {
            drv_path: drv.clone(),
            outputs: outputs(&["out"]),
          }],
          BuildMode::Normal,
        )
        .unwrap();

      let res = to_output_paths(
        &*t.store,
        &Settings::default(),
        &[store_path(&t.store, &out)],
        RealiseMode::FullOutputs,
        OperateOn::Derivation,
      )
      .unwrap();
      assert_eq!(res, vec![BuiltPath::Opaque { path: drv }]);
    }

    #[test]
    fn derivations_are_their_own_derivation() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out"]);

      let drvs = to_derivations(&*t.store, &[store_path(&t.store, &drv)], false).unwrap();
      assert_eq!(drvs, BTreeSet::from([drv]));
    }

    #[test]
    fn unknown_deriver_is_an_error() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out"]);
      let out = t.static_output(&drv, "out");
      write_output(&t.store, &out);

      let err = to_derivations(&*t.store, &[store_path(&t.store, &out)], true).unwrap_err();
      assert!(matches!(err, Error::NoDeriver { .. }));
      assert!(err.to_string().ends_with("does not have a known deriver"));
    }

    #[test]
    fn paths_without_deriver_lookup_are_rejected() {
      let t = TestStore::new();
      let path = t.store.add_text_to_store("note", "x").unwrap();

      let err = to_derivations(&*t.store, &[store_path(&t.store, &path)], false).unwrap_err();
      assert!(matches!(err, Error::NotADerivationInstallable { .. }));
    }

    #[test]
    fn dry_run_derivations_lock_the_store() {
      let t = TestStore::new();
      let drv = t.add_drv("hello", &["out"]);

      to_output_paths(
        &*t.store,
        &Settings::default(),
        &[store_path(&t.store, &drv)],
        RealiseMode::DryRun,
        OperateOn::Derivation,
      )
      .unwrap();
      assert!(t.store.is_read_only());
    }
  }
}
