//! From build requests to concrete output paths.

use std::collections::BTreeMap;

use tracing::trace;

use crate::derived_path::{BuiltPath, DerivedPath};
use crate::error::{Error, Result};
use crate::settings::{ExperimentalFeature, Settings};
use crate::store::{DrvOutput, Store, static_output_hashes};

/// The concrete paths `requests` refer to.
///
/// Opaque requests are their own result. For built requests the derivation
/// is read and each wanted output is looked up: through its realisation
/// when content-addressed derivations are enabled, and as the statically
/// known path otherwise.
pub fn get_built_paths(store: &dyn Store, settings: &Settings, requests: &[DerivedPath]) -> Result<Vec<BuiltPath>> {
  let ca_enabled = settings.is_experimental_feature_enabled(ExperimentalFeature::CaDerivations);
  let store_dir = store.store_dir();

  let mut res = Vec::with_capacity(requests.len());
  for request in requests {
    match request {
      DerivedPath::Opaque { path } => res.push(BuiltPath::Opaque { path: path.clone() }),
      DerivedPath::Built { drv_path, outputs } => {
        let drv = store.read_derivation(drv_path)?;
        let output_hashes = static_output_hashes(store, &drv)?;
        let drv_outputs = drv.outputs_and_opt_paths();

        let mut built = BTreeMap::new();
        for output in outputs {
          let Some(output_hash) = output_hashes.get(output) else {
            return Err(Error::MissingOutput {
              drv: store_dir.print(drv_path),
              output: output.clone(),
            });
          };

          let path = if ca_enabled {
            let id = DrvOutput::new(output_hash.clone(), output.clone());
            match store.query_realisation(&id)? {
              Some(realisation) => realisation.out_path,
              None => return Err(Error::UnbuiltCaOutput { id: id.to_string() }),
            }
          } else {
            match drv_outputs.get(output) {
              Some(Some(path)) => path.clone(),
              _ => {
                return Err(Error::Internal(format!(
                  "output '{}' of '{}' has no statically known path",
                  output,
                  store_dir.print(drv_path)
                )));
              }
            }
          };

          trace!(drv = %drv_path, output = %output, path = %path, "resolved output");
          built.insert(output.clone(), path);
        }

        res.push(BuiltPath::Built {
          drv_path: drv_path.clone(),
          outputs: built,
        });
      }
    }
  }
  Ok(res)
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use super::*;
  use crate::store::{BuildMode, Realisation, StorePath};
  use crate::util::testutil::TestStore;

  fn ca_settings() -> Settings {
    let mut settings = Settings::default();
    settings.experimental_features.insert(ExperimentalFeature::CaDerivations);
    settings
  }

  fn built(drv_path: &StorePath, outputs: &[&str]) -> DerivedPath {
    DerivedPath::Built {
      drv_path: drv_path.clone(),
      outputs: outputs.iter().map(|o| o.to_string()).collect(),
    }
  }

  #[test]
  fn static_outputs_resolve_without_building() {
    let t = TestStore::new();
    let drv = t.add_drv("hello", &["out", "dev"]);

    let res = get_built_paths(&*t.store, &Settings::default(), &[built(&drv, &["dev"])]).unwrap();
    assert_eq!(
      res,
      vec![BuiltPath::Built {
        drv_path: drv.clone(),
        outputs: BTreeMap::from([("dev".to_string(), t.static_output(&drv, "dev"))]),
      }]
    );
  }

  #[test]
  fn opaque_paths_are_their_own_result() {
    let t = TestStore::new();
    let path = t.store.add_text_to_store("note", "x").unwrap();

    let res = get_built_paths(&*t.store, &Settings::default(), &[DerivedPath::Opaque { path: path.clone() }]).unwrap();
    assert_eq!(res, vec![BuiltPath::Opaque { path }]);
  }

  #[test]
  fn undeclared_output_is_a_mismatch() {
    let t = TestStore::new();
    let drv = t.add_drv("hello", &["out"]);

    let err = get_built_paths(&*t.store, &Settings::default(), &[built(&drv, &["doc"])]).unwrap_err();
    assert!(matches!(err, Error::MissingOutput { ref output, .. } if output == "doc"));
    assert!(err.to_string().ends_with("doesn't have an output named 'doc'"));
  }

  #[test]
  fn unbuilt_ca_output_is_not_a_mismatch() {
    let t = TestStore::new();
    let drv_path = t.add_ca_drv("floating", &["out", "dev"]);
    let drv = t.store.read_derivation(&drv_path).unwrap();
    let hashes = static_output_hashes(&*t.store, &drv).unwrap();
    let out = t.store.add_text_to_store("floating", "built").unwrap();
    t.store
      .register_realisation(&Realisation {
        id: DrvOutput::new(hashes["out"].clone(), "out"),
        out_path: out.clone(),
      })
      .unwrap();
    let settings = ca_settings();

    let res = get_built_paths(&*t.store, &settings, &[built(&drv_path, &["out"])]).unwrap();
    assert_eq!(res[0].out_paths(), BTreeSet::from([out]));

    let err = get_built_paths(&*t.store, &settings, &[built(&drv_path, &["dev"])]).unwrap_err();
    assert!(matches!(err, Error::UnbuiltCaOutput { .. }));
    assert!(err.to_string().starts_with("cannot operate on an output of unbuilt content-addressed derivation"));

    let err = get_built_paths(&*t.store, &settings, &[built(&drv_path, &["doc"])]).unwrap_err();
    assert!(matches!(err, Error::MissingOutput { .. }));
  }

  #[test]
  fn ca_mode_uses_realisations_for_input_addressed_outputs() {
    let t = TestStore::building();
    let drv = t.add_drv("hello", &["out"]);
    let settings = ca_settings();

    let err = get_built_paths(&*t.store, &settings, &[built(&drv, &["out"])]).unwrap_err();
    assert!(matches!(err, Error::UnbuiltCaOutput { .. }));

    t.store.build_paths(&[built(&drv, &["out"])], BuildMode::Normal).unwrap();
    let res = get_built_paths(&*t.store, &settings, &[built(&drv, &["out"])]).unwrap();
    assert_eq!(res[0].out_paths(), BTreeSet::from([t.static_output(&drv, "out")]));
  }

  #[test]
  fn floating_outputs_without_the_feature_are_internal_errors() {
    let t = TestStore::new();
    let drv = t.add_ca_drv("floating", &["out"]);

    let err = get_built_paths(&*t.store, &Settings::default(), &[built(&drv, &["out"])]).unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
  }
}
