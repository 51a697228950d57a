//! Realising installables in a store.

use std::collections::BTreeSet;

use realise_lib::Error;
use realise_lib::derived_path::{BuiltPath, DerivedPath, OperateOn, RealiseMode};
use realise_lib::realise::{
  build, exactly_one_path, flatten_to_path_set, realise, resolve_to_requests, to_derivations, to_output_paths,
};
use realise_lib::store::{BuildMode, Store, StorePath};

use super::common::{CA_FLAKE, HELLO_FLAKE, TestEnv};

fn built_outputs(built: &BuiltPath) -> Vec<String> {
  match built {
    BuiltPath::Built { outputs, .. } => outputs.keys().cloned().collect(),
    BuiltPath::Opaque { .. } => Vec::new(),
  }
}

mod building {
  use super::*;

  #[test]
  fn outputs_of_one_derivation_are_built_together() {
    let env = TestEnv::building();
    env.write_flake("hello", HELLO_FLAKE);
    let installables = env.parse(&["./hello#hello", "./hello#hello.dev"]);

    let requests = resolve_to_requests(&installables).unwrap();
    assert_eq!(requests.len(), 1);

    let built = build(
      &*env.store,
      env.settings(),
      &installables,
      RealiseMode::FullOutputs,
      BuildMode::Normal,
    )
    .unwrap();
    assert_eq!(built.len(), 1);
    assert_eq!(built_outputs(&built[0]), vec!["dev", "out"]);
    for path in built[0].out_paths() {
      assert!(env.store.is_valid_path(&path).unwrap());
    }
  }

  #[test]
  fn dependencies_are_built_first() {
    let env = TestEnv::building();
    env.write_flake("hello", HELLO_FLAKE);
    let installables = env.parse(&["./hello#greeting"]);

    let built = build(
      &*env.store,
      env.settings(),
      &installables,
      RealiseMode::FullOutputs,
      BuildMode::Normal,
    )
    .unwrap();
    let greeting = built[0].out_paths();
    assert_eq!(greeting.len(), 1);

    let dev = env.parse(&["./hello#hello.dev"]);
    let paths = flatten_to_path_set(
      &*env.store,
      env.settings(),
      &dev,
      RealiseMode::DerivationOnly,
      OperateOn::Output,
    )
    .unwrap();
    for path in paths {
      assert!(env.store.is_valid_path(&path).unwrap());
    }
  }

  #[test]
  fn building_without_a_hook_fails() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let installables = env.parse(&["./hello#hello"]);

    let err = build(
      &*env.store,
      env.settings(),
      &installables,
      RealiseMode::FullOutputs,
      BuildMode::Normal,
    )
    .unwrap_err();
    assert!(err.to_string().contains("no build hook"), "{err}");
  }
}

mod dry_run {
  use super::*;

  #[test]
  fn reports_paths_without_building() {
    let env = TestEnv::building();
    env.write_flake("hello", HELLO_FLAKE);
    let installables = env.parse(&["./hello#greeting"]);
    let requests = resolve_to_requests(&installables).unwrap();

    let missing = env.store.query_missing(&requests).unwrap();
    assert_eq!(missing.will_build.len(), 2);
    assert!(missing.unknown.is_empty());

    let built = realise(
      &*env.store,
      env.settings(),
      &requests,
      RealiseMode::DryRun,
      BuildMode::Normal,
    )
    .unwrap();
    assert!(env.store.is_read_only());
    for path in built[0].out_paths() {
      assert!(!env.store.is_valid_path(&path).unwrap());
    }
  }

  #[test]
  fn derivation_mode_leaves_the_store_read_only() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let installables = env.parse(&["./hello#hello"]);

    let built = to_output_paths(
      &*env.store,
      env.settings(),
      &installables,
      RealiseMode::DryRun,
      OperateOn::Derivation,
    )
    .unwrap();
    assert!(env.store.is_read_only());
    let [BuiltPath::Opaque { path }] = built.as_slice() else {
      panic!("expected one opaque path, got {:?}", built);
    };
    assert!(path.is_derivation());
  }

  #[test]
  fn derivation_mode_handles_dependent_derivations() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let installables = env.parse(&["./hello#greeting"]);

    let built = to_output_paths(
      &*env.store,
      env.settings(),
      &installables,
      RealiseMode::DryRun,
      OperateOn::Derivation,
    )
    .unwrap();
    let [BuiltPath::Opaque { path }] = built.as_slice() else {
      panic!("expected one opaque path, got {:?}", built);
    };
    assert!(!env.store.store_dir().to_path(path).exists());

    let greeting = env.store.read_derivation(path).unwrap();
    assert_eq!(greeting.name, "greeting");
    assert_eq!(greeting.input_drvs.len(), 1);
    let (hello, outputs) = greeting.input_drvs.iter().next().unwrap();
    assert_eq!(outputs, &BTreeSet::from(["dev".to_string()]));
    assert_eq!(env.store.read_derivation(hello).unwrap().name, "hello");
  }
}

mod paths {
  use super::*;

  #[test]
  fn exactly_one_path_per_output() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let installables = env.parse(&["./hello#hello"]);

    let path = exactly_one_path(
      &*env.store,
      env.settings(),
      &installables[0],
      RealiseMode::DerivationOnly,
      OperateOn::Output,
    )
    .unwrap();
    assert_eq!(path.name(), "hello");
  }

  #[test]
  fn derivations_with_several_outputs_are_not_one_path() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let drv_path = env.parse(&["./hello#hello"])[0].to_derivations().unwrap().remove(0).drv_path;
    let printed = env.print(&drv_path);
    let installables = env.parse(&[printed.as_str()]);

    let err = exactly_one_path(
      &*env.store,
      env.settings(),
      &installables[0],
      RealiseMode::DerivationOnly,
      OperateOn::Output,
    )
    .unwrap_err();
    assert!(matches!(err, Error::NotOneStorePath { count: 2, .. }), "{err}");
  }

  #[test]
  fn built_outputs_lead_back_to_their_deriver() {
    let env = TestEnv::building();
    env.write_flake("hello", HELLO_FLAKE);
    let flake = env.parse(&["./hello#hello"]);
    let built = build(
      &*env.store,
      env.settings(),
      &flake,
      RealiseMode::FullOutputs,
      BuildMode::Normal,
    )
    .unwrap();
    let BuiltPath::Built { drv_path, outputs } = &built[0] else {
      panic!("expected a built path");
    };

    let printed = env.print(&outputs["out"]);
    let output = env.parse(&[printed.as_str()]);
    assert_eq!(
      to_derivations(&*env.store, &output, true).unwrap(),
      BTreeSet::from([drv_path.clone()])
    );
  }

  #[test]
  fn paths_without_deriver_are_rejected() {
    let env = TestEnv::new();
    let path = env.store.add_text_to_store("note", "hello").unwrap();
    let printed = env.print(&path);
    let installables = env.parse(&[printed.as_str()]);

    let err = to_derivations(&*env.store, &installables, true).unwrap_err();
    assert!(matches!(err, Error::NoDeriver { .. }), "{err}");
    let err = to_derivations(&*env.store, &installables, false).unwrap_err();
    assert!(matches!(err, Error::NotADerivationInstallable { .. }), "{err}");
  }
}

mod content_addressed {
  use super::*;

  fn ca_request(env: &TestEnv) -> Vec<DerivedPath> {
    env.write_flake("ca", CA_FLAKE);
    let installables = env.parse(&["./ca"]);
    resolve_to_requests(&installables).unwrap()
  }

  #[test]
  fn unbuilt_outputs_have_no_path() {
    let env = TestEnv::content_addressed();
    let requests = ca_request(&env);

    let err = realise(
      &*env.store,
      env.settings(),
      &requests,
      RealiseMode::DerivationOnly,
      BuildMode::Normal,
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnbuiltCaOutput { .. }), "{err}");
  }

  #[test]
  fn built_outputs_resolve_through_realisations() {
    let env = TestEnv::content_addressed();
    let requests = ca_request(&env);

    let built = realise(
      &*env.store,
      env.settings(),
      &requests,
      RealiseMode::FullOutputs,
      BuildMode::Normal,
    )
    .unwrap();
    let out: Vec<StorePath> = built[0].out_paths().into_iter().collect();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name(), "ca");

    let again = realise(
      &*env.store,
      env.settings(),
      &requests,
      RealiseMode::DerivationOnly,
      BuildMode::Normal,
    )
    .unwrap();
    assert_eq!(again, built);
  }
}
