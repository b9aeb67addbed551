//! GKE hello-world end-to-end smoke test.
//!
//! Provisions a GKE cluster with Terraform, deploys a hello-world workload
//! with kubectl, verifies it over HTTP through its load balancer, and tears
//! everything down again in reverse order, whatever the outcome.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gke_e2e::{E2eConfig, HelloWorldTest, SystemRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = E2eConfig::with_defaults(".");
//!     let test = HelloWorldTest::new(config, Arc::new(SystemRunner))?;
//!     test.run().await.into_result()?;
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod gcloud;
pub mod http;
pub mod ids;
pub mod kubectl;
pub mod orchestrator;
pub mod retry;
pub mod shell;
pub mod terraform;
pub mod ui;
pub mod validator;

pub use cleanup::{CleanupRecord, CleanupStack};
pub use config::{E2eConfig, ToolPaths};
pub use error::{E2eError, Result};
pub use ids::{NamespaceName, RunId};
pub use orchestrator::{HelloWorldTest, RunReport, Step, StepRecord};
pub use retry::{PollConfig, RetryableErrors};
pub use shell::{CommandOutput, CommandRunner, ShellCommand, SystemRunner};
