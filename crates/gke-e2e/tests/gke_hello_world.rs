//! Full run against a real GCP project.
//!
//! Requires terraform, gcloud and kubectl on `PATH`, application-default
//! credentials, and a `project` set in `terraform/varfile.tfvars` (or a
//! config file named by `GKE_E2E_CONFIG`). Run with:
//!
//! ```text
//! cargo test -p gke-e2e --test gke_hello_world -- --ignored --nocapture
//! ```

use std::path::Path;
use std::sync::Arc;

use gke_e2e::{E2eConfig, HelloWorldTest, Step, SystemRunner};
use serial_test::serial;

fn config() -> E2eConfig {
    match std::env::var("GKE_E2E_CONFIG") {
        Ok(path) => E2eConfig::load(Path::new(&path)).unwrap(),
        Err(_) => E2eConfig::with_defaults(Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")),
    }
}

#[tokio::test]
#[ignore = "provisions real GKE infrastructure"]
#[serial]
async fn test_gke_hello_world() {
    let test = HelloWorldTest::new(config(), Arc::new(SystemRunner)).unwrap();
    let report = test.run().await;

    assert!(
        report.cleanup_failures().is_empty(),
        "resources may need manual cleanup: {:?}",
        report.cleanup_failures()
    );
    assert!(report.completed(Step::VerifyHttp), "run failed: {:?}", report.error);
    report.into_result().unwrap();
}
