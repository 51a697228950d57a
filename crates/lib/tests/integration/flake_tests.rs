//! Resolving flake, expression and store path installables.

use std::collections::BTreeSet;

use realise_lib::Error;
use realise_lib::derived_path::DerivedPath;
use realise_lib::installable::{Installable, InstallableOptions};
use realise_lib::store::Store;

use super::common::{HELLO_FLAKE, TestEnv};

const LEAF_FLAKE: &str = r#"return {
  outputs = function(inputs) return { value = "leaf" } end,
}"#;

const APP_FLAKE: &str = r#"return {
  inputs = { leaf = "../leaf" },
  outputs = function(inputs)
    return { lib = { fromLeaf = inputs.leaf.value } }
  end,
}"#;

fn outputs(names: &[&str]) -> BTreeSet<String> {
  names.iter().map(|s| s.to_string()).collect()
}

mod flakes {
  use super::*;

  #[test]
  fn default_package_is_used_without_a_fragment() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);

    let installables = env.parse(&["./hello"]);
    let [Installable::Flake(flake)] = installables.as_slice() else {
      panic!("expected one flake installable, got {:?}", installables);
    };
    assert_eq!(flake.attr_paths, env.settings().default_flake_attr_paths());

    let (attr_path, info) = flake.to_derivation().unwrap();
    assert_eq!(attr_path, "packages.x86_64-linux.default");
    assert_eq!(info.output_name, "out");
    assert_eq!(env.store.read_derivation(&info.drv_path).unwrap().name, "hello");
  }

  #[test]
  fn fragments_select_outputs() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);

    let installables = env.parse(&["./hello#hello.dev"]);
    let request = installables[0].to_derived_path().unwrap();
    let DerivedPath::Built { drv_path, outputs: wanted } = request else {
      panic!("expected a built request");
    };
    assert_eq!(wanted, outputs(&["dev"]));
    assert!(drv_path.is_derivation());
  }

  #[test]
  fn non_package_attributes_evaluate_to_values() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);

    let installables = env.parse(&["./hello#lib.version"]);
    let (value, pos) = installables[0].to_value().unwrap();
    assert_eq!(value.to_json().unwrap(), serde_json::json!("1.0"));
    assert_eq!(pos.attr_path, "lib.version");

    let err = installables[0].to_derived_paths().unwrap_err();
    assert!(matches!(err, Error::NotADerivation { .. }), "{err}");
  }

  #[test]
  fn missing_attributes_name_every_candidate() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);

    let installables = env.parse(&["./hello#missing"]);
    let err = installables[0].to_derived_paths().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("'packages.x86_64-linux.missing'"), "{message}");
    assert!(message.contains("'legacyPackages.x86_64-linux.missing'"), "{message}");
    assert!(message.contains("'missing'"), "{message}");
  }

  #[test]
  fn cached_resolution_needs_no_evaluation() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let first = env.parse(&["./hello#hello"])[0].to_derived_paths().unwrap();

    let state = env.reopen(|settings| settings.allow_eval = false);
    let cached = env.parse_with(&state, &InstallableOptions::default(), &["./hello#hello"]);
    assert_eq!(cached[0].to_derived_paths().unwrap(), first);
  }

  #[test]
  fn inputs_are_locked_and_passed_to_outputs() {
    let env = TestEnv::new();
    env.write_flake("leaf", LEAF_FLAKE);
    let dir = env.write_flake("app", APP_FLAKE);

    let installables = env.parse(&["./app#lib.fromLeaf"]);
    let (value, _) = installables[0].to_value().unwrap();
    assert_eq!(value.to_json().unwrap(), serde_json::json!("leaf"));
    assert!(dir.join("flake.lock").is_file());
  }
}

mod expressions {
  use super::*;

  const PACKAGES: &str = r#"{
    hello = builtins.derivation { name = 'hello', system = 'x86_64-linux', builder = '/bin/sh' },
    nested = { value = 42 },
  }"#;

  fn expr_options() -> InstallableOptions {
    InstallableOptions {
      expr: Some(PACKAGES.to_string()),
      ..InstallableOptions::default()
    }
  }

  #[test]
  fn attribute_paths_select_derivations() {
    let env = TestEnv::new();
    let installables = env.parse_with(&env.state, &expr_options(), &["hello"]);
    assert!(matches!(installables[0], Installable::AttrPath(_)));

    let derivations = installables[0].to_derivations().unwrap();
    assert_eq!(derivations.len(), 1);
    assert_eq!(derivations[0].output_name, "out");
    assert!(derivations[0].out_path.is_some());
  }

  #[test]
  fn attribute_paths_evaluate_to_values() {
    let env = TestEnv::new();
    let installables = env.parse_with(&env.state, &expr_options(), &["nested.value"]);
    let (value, _) = installables[0].to_value().unwrap();
    assert_eq!(value.to_json().unwrap(), serde_json::json!(42));
  }

  #[test]
  fn missing_attributes_are_reported() {
    let env = TestEnv::new();
    let installables = env.parse_with(&env.state, &expr_options(), &["nested.other"]);
    let err = installables[0].to_value().unwrap_err();
    assert!(matches!(err, Error::AttrNotFound { ref attr, .. } if attr == "other"), "{err}");
  }

  #[test]
  fn files_are_evaluated_impurely() {
    let env = TestEnv::new();
    let file = env.temp.path().join("default.lua");
    std::fs::write(&file, format!("return {}", PACKAGES)).unwrap();

    let options = InstallableOptions {
      file: Some(file),
      ..InstallableOptions::default()
    };
    let mut settings = env.settings().clone();
    options.adjust_settings(&mut settings);
    assert!(!settings.pure_eval);

    let installables = env.parse_with(&env.state, &options, &["hello"]);
    assert_eq!(installables[0].to_derived_paths().unwrap().len(), 1);
  }
}

mod store_paths {
  use super::*;

  #[test]
  fn derivations_stand_for_all_outputs() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let info = env.parse(&["./hello#hello"])[0].to_derivations().unwrap().remove(0);

    let printed = env.print(&info.drv_path);
    let installables = env.parse(&[printed.as_str()]);
    assert!(matches!(installables[0], Installable::StorePath(_)));
    assert_eq!(
      installables[0].to_derived_path().unwrap(),
      DerivedPath::Built {
        drv_path: info.drv_path,
        outputs: outputs(&["dev", "out"]),
      }
    );
  }

  #[test]
  fn store_paths_cannot_be_evaluated() {
    let env = TestEnv::new();
    let path = env.store.add_text_to_store("note", "hello").unwrap();
    let printed = env.print(&path);

    let installables = env.parse(&[printed.as_str()]);
    assert_eq!(
      installables[0].to_derived_paths().unwrap(),
      vec![DerivedPath::Opaque { path }]
    );
    assert!(matches!(
      installables[0].to_value().unwrap_err(),
      Error::CannotEvaluate { .. }
    ));
  }
}
