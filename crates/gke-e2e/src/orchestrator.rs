//! Run orchestration.
//!
//! This module drives the whole smoke test, coordinating:
//! - Terraform provisioning of the GKE cluster
//! - Cluster credentials and readiness
//! - Namespace + manifest deployment
//! - Service and HTTP verification
//! - Teardown of everything created, in reverse order, on every exit path

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Serialize, Serializer};
use tempfile::TempDir;
use tracing::{error, info};

use crate::cleanup::{CleanupRecord, CleanupStack};
use crate::config::E2eConfig;
use crate::error::{E2eError, Result};
use crate::gcloud;
use crate::http;
use crate::ids::{NamespaceName, RunId};
use crate::kubectl::{self, KubectlOptions, ServiceEndpoint};
use crate::shell::CommandRunner;
use crate::terraform::{self, ProvisioningOutputs, TerraformOptions};
use crate::ui;

/// Forward steps of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Generate the run identifier and cluster name.
    GenerateRunId,
    /// Copy the module and `terraform init` + `apply`.
    Provision,
    /// Read `cluster_name`, `region`, `project`.
    ReadOutputs,
    /// `gcloud ... get-credentials` into an isolated kubeconfig.
    ConfigureCredentials,
    /// Derive the kubectl context and namespace.
    DeriveContext,
    /// Wait for every node to be Ready.
    WaitNodesReady,
    /// Create the run's namespace.
    CreateNamespace,
    /// `kubectl apply -f` the workload manifest.
    ApplyManifest,
    /// Wait for the service to be available.
    WaitServiceAvailable,
    /// Resolve the service's external endpoint.
    ResolveEndpoint,
    /// Check the service type.
    AssertServiceType,
    /// GET the endpoint and check status and body.
    VerifyHttp,
}

impl Step {
    /// Every step, in order.
    pub const ALL: [Step; 12] = [
        Step::GenerateRunId,
        Step::Provision,
        Step::ReadOutputs,
        Step::ConfigureCredentials,
        Step::DeriveContext,
        Step::WaitNodesReady,
        Step::CreateNamespace,
        Step::ApplyManifest,
        Step::WaitServiceAvailable,
        Step::ResolveEndpoint,
        Step::AssertServiceType,
        Step::VerifyHttp,
    ];

    /// Total forward steps.
    #[allow(clippy::cast_possible_truncation)]
    pub const TOTAL_STEPS: u8 = Self::ALL.len() as u8;

    /// 1-based position of this step.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn number(self) -> u8 {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0) as u8 + 1
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::GenerateRunId => "Generating run identifier",
            Self::Provision => "Provisioning infrastructure",
            Self::ReadOutputs => "Reading provisioning outputs",
            Self::ConfigureCredentials => "Configuring cluster credentials",
            Self::DeriveContext => "Deriving cluster context",
            Self::WaitNodesReady => "Waiting for nodes to be ready",
            Self::CreateNamespace => "Creating namespace",
            Self::ApplyManifest => "Applying workload manifest",
            Self::WaitServiceAvailable => "Waiting for service to be available",
            Self::ResolveEndpoint => "Resolving service endpoint",
            Self::AssertServiceType => "Checking service type",
            Self::VerifyHttp => "Verifying HTTP response",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Timing of one completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    /// The step.
    pub step: Step,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Outcome of one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// Requested cluster name.
    pub cluster_name: String,
    /// Namespace, once generated.
    pub namespace: Option<String>,
    /// Resolved endpoint, once known.
    pub endpoint: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When cleanup finished.
    pub finished_at: DateTime<Utc>,
    /// Forward steps that completed, in order.
    pub steps: Vec<StepRecord>,
    /// Cleanup actions in execution order.
    pub cleanup: Vec<CleanupRecord>,
    /// Step that failed, if any.
    pub failed_step: Option<Step>,
    /// Primary failure, if any. Cleanup errors never replace it.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<E2eError>,
}

impl RunReport {
    /// Whether every forward step passed.
    ///
    /// Cleanup failures are reported separately and do not flip this.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether `step` completed.
    #[must_use]
    pub fn completed(&self, step: Step) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }

    /// Cleanup actions that failed.
    #[must_use]
    pub fn cleanup_failures(&self) -> Vec<&CleanupRecord> {
        self.cleanup.iter().filter(|c| !c.succeeded()).collect()
    }

    /// Convert into a plain result.
    ///
    /// # Errors
    ///
    /// Returns the primary failure of the run.
    pub fn into_result(self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[allow(clippy::ref_option)]
fn serialize_error<S: Serializer>(error: &Option<E2eError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

/// Mutable state accumulated while stepping forward.
struct RunState {
    run_id: RunId,
    cluster_name: String,
    /// Temp copy of the module; dropped only after cleanup has run.
    workdir: Option<TempDir>,
    outputs: Option<ProvisioningOutputs>,
    kubeconfig: Option<PathBuf>,
    kubectl: Option<KubectlOptions>,
    endpoint: Option<ServiceEndpoint>,
    steps: Vec<StepRecord>,
    current: Step,
}

impl RunState {
    fn new(config: &E2eConfig) -> Self {
        let run_id = RunId::generate();
        let cluster_name = run_id.cluster_name(&config.cluster_name_prefix);
        Self {
            run_id,
            cluster_name,
            workdir: None,
            outputs: None,
            kubeconfig: None,
            kubectl: None,
            endpoint: None,
            steps: Vec::new(),
            current: Step::GenerateRunId,
        }
    }

    fn begin(&mut self, step: Step) -> Instant {
        self.current = step;
        ui::print_progress_step(step.number(), Step::TOTAL_STEPS, step.description());
        info!(step = ?step, run_id = %self.run_id, "Executing step");
        Instant::now()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn finish(&mut self, step: Step, started: Instant) {
        self.steps.push(StepRecord {
            step,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

/// State a step depends on; missing means steps ran out of order.
fn require<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T> {
    value.ok_or_else(|| E2eError::Config(format!("{what} not available at this step")))
}

/// The provision → deploy → verify → teardown smoke test.
pub struct HelloWorldTest {
    config: E2eConfig,
    runner: Arc<dyn CommandRunner>,
    http: reqwest::Client,
}

impl HelloWorldTest {
    /// Create a run with the given command runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the HTTP client cannot
    /// be built.
    pub fn new(config: E2eConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        config.validate()?;
        let http = http::client(config.http_timeout)?;
        Ok(Self {
            config,
            runner,
            http,
        })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &E2eConfig {
        &self.config
    }

    /// Execute the run.
    ///
    /// Forward steps stop at the first failure; the cleanup stack is then
    /// drained unconditionally.
    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let mut state = RunState::new(&self.config);
        let mut cleanup = CleanupStack::new();

        info!(
            run_id = %state.run_id,
            cluster = %state.cluster_name,
            "Starting hello-world run"
        );

        let result = self.execute(&mut state, &mut cleanup).await;
        let failed_step = match &result {
            Ok(()) => {
                ui::print_success("All verification steps passed");
                None
            }
            Err(e) => {
                error!(step = ?state.current, error = %e, "Run failed");
                ui::print_error(&format!("Failed at step '{}': {e}", state.current));
                Some(state.current)
            }
        };

        if !cleanup.is_empty() {
            ui::print_section("Cleanup");
        }
        let cleanup_records = cleanup.run_all().await;
        for record in &cleanup_records {
            match &record.error {
                None => ui::print_success(&format!("{} done", record.label)),
                Some(err) => ui::print_warning(&format!("{} failed: {err}", record.label)),
            }
        }

        // The module copy must outlive `terraform destroy`.
        drop(state.workdir.take());

        RunReport {
            run_id: state.run_id.to_string(),
            cluster_name: state.cluster_name,
            namespace: state.kubectl.map(|k| k.namespace.to_string()),
            endpoint: state.endpoint.map(|e| e.to_string()),
            started_at,
            finished_at: Utc::now(),
            steps: state.steps,
            cleanup: cleanup_records,
            failed_step,
            error: result.err(),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn execute(&self, state: &mut RunState, cleanup: &mut CleanupStack) -> Result<()> {
        let config = &self.config;
        let runner = self.runner.as_ref();

        // 1. Run identifier (generated with the state).
        let t = state.begin(Step::GenerateRunId);
        info!(run_id = %state.run_id, cluster = %state.cluster_name, "Generated run identifier");
        state.finish(Step::GenerateRunId, t);

        // 2. Provision.
        let t = state.begin(Step::Provision);
        let workdir = terraform::copy_folder_to_temp(&config.terraform_dir)?;
        let mut tf = TerraformOptions::new(workdir.path())
            .with_var(&config.cluster_name_var, &state.cluster_name)
            .with_lock(config.lock)
            .with_binary(&config.tools.terraform)
            .with_retry(config.terraform_retry);
        for file in &config.var_files {
            tf = tf.with_var_file(file);
        }
        let kubeconfig = workdir.path().join(&config.kubeconfig_file);
        state.workdir = Some(workdir);

        terraform::init(runner, &tf).await?;
        // Registered before apply: a failed apply can leave part of the
        // module created, and destroying nothing is a no-op.
        {
            let runner = Arc::clone(&self.runner);
            let tf = tf.clone();
            cleanup.push("Destroy infrastructure", move || {
                async move { terraform::destroy(runner.as_ref(), &tf).await }.boxed()
            });
        }
        terraform::apply(runner, &tf).await?;
        state.finish(Step::Provision, t);

        // 3. Outputs.
        let t = state.begin(Step::ReadOutputs);
        let outputs = ProvisioningOutputs::read(runner, &tf).await?;
        info!(
            cluster = %outputs.cluster_name,
            region = %outputs.region,
            project = %outputs.project,
            "Read provisioning outputs"
        );
        state.outputs = Some(outputs);
        state.finish(Step::ReadOutputs, t);

        // 4. Credentials.
        let t = state.begin(Step::ConfigureCredentials);
        let outputs = require(state.outputs.as_ref(), "provisioning outputs")?;
        gcloud::get_credentials(runner, &config.tools.gcloud, outputs, &kubeconfig).await?;
        state.kubeconfig = Some(kubeconfig);
        state.finish(Step::ConfigureCredentials, t);

        // 5. Context.
        let t = state.begin(Step::DeriveContext);
        let outputs = require(state.outputs.as_ref(), "provisioning outputs")?;
        let kubeconfig = require(state.kubeconfig.as_ref(), "kubeconfig")?;
        let context = gcloud::context_name(outputs);
        let namespace = NamespaceName::generate(&config.namespace_prefix)?;
        info!(context = %context, namespace = %namespace, "Derived cluster context");
        state.kubectl = Some(
            KubectlOptions::new(context, kubeconfig.clone(), namespace)
                .with_binary(&config.tools.kubectl),
        );
        state.finish(Step::DeriveContext, t);

        let cluster = require(state.kubectl.as_ref(), "kubectl options")?.clone();

        // 6. Nodes.
        let t = state.begin(Step::WaitNodesReady);
        kubectl::wait_until_all_nodes_ready(runner, &cluster, &config.nodes_ready).await?;
        state.finish(Step::WaitNodesReady, t);

        // 7. Namespace.
        let t = state.begin(Step::CreateNamespace);
        kubectl::create_namespace(runner, &cluster).await?;
        {
            let runner = Arc::clone(&self.runner);
            let cluster = cluster.clone();
            cleanup.push(format!("Delete namespace {}", cluster.namespace), move || {
                async move { kubectl::delete_namespace(runner.as_ref(), &cluster).await }.boxed()
            });
        }
        state.finish(Step::CreateNamespace, t);

        // 8. Manifest.
        let t = state.begin(Step::ApplyManifest);
        let manifest = std::fs::canonicalize(&config.manifest_path)
            .map_err(|e| E2eError::io(&config.manifest_path, e))?;
        kubectl::apply(runner, &cluster, &manifest).await?;
        {
            let runner = Arc::clone(&self.runner);
            let cluster = cluster.clone();
            let manifest = manifest.clone();
            cleanup.push(
                format!("Delete manifest {}", manifest.display()),
                move || {
                    async move { kubectl::delete(runner.as_ref(), &cluster, &manifest).await }
                        .boxed()
                },
            );
        }
        state.finish(Step::ApplyManifest, t);

        // 9. Service availability.
        let t = state.begin(Step::WaitServiceAvailable);
        let service = kubectl::wait_until_service_available(
            runner,
            &cluster,
            &config.service_name,
            &config.service_available,
        )
        .await?;
        state.finish(Step::WaitServiceAvailable, t);

        // 10. Endpoint.
        let t = state.begin(Step::ResolveEndpoint);
        let endpoint =
            kubectl::service_endpoint(runner, &cluster, &service, config.service_port).await?;
        let url = endpoint.url();
        state.endpoint = Some(endpoint);
        state.finish(Step::ResolveEndpoint, t);

        // 11. Service type.
        let t = state.begin(Step::AssertServiceType);
        let actual = kubectl::service_type(&service);
        if actual != config.expected_service_type {
            return Err(E2eError::AssertionFailed {
                subject: format!("type of service {}", config.service_name),
                expected: config.expected_service_type.clone(),
                actual: actual.to_string(),
            });
        }
        state.finish(Step::AssertServiceType, t);

        // 12. HTTP.
        let t = state.begin(Step::VerifyHttp);
        http::http_get_with_retry(
            &self.http,
            &url,
            config.expected_status,
            &config.expected_body,
            &config.http_retry,
        )
        .await?;
        state.finish(Step::VerifyHttp, t);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_numbers() {
        assert_eq!(Step::GenerateRunId.number(), 1);
        assert_eq!(Step::VerifyHttp.number(), Step::TOTAL_STEPS);
        assert_eq!(Step::TOTAL_STEPS, 12);
    }

    #[test]
    fn test_steps_are_ordered() {
        let numbers: Vec<u8> = Step::ALL.iter().map(|s| s.number()).collect();
        assert_eq!(numbers, (1..=12).collect::<Vec<u8>>());
    }

    #[test]
    fn test_report_result() {
        let report = RunReport {
            run_id: "abc123".into(),
            cluster_name: "test-abc123".into(),
            namespace: None,
            endpoint: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            steps: vec![],
            cleanup: vec![CleanupRecord {
                label: "Destroy infrastructure".into(),
                error: Some("boom".into()),
            }],
            failed_step: Some(Step::Provision),
            error: Some(E2eError::NotReady("x".into())),
        };
        assert!(!report.is_success());
        assert_eq!(report.cleanup_failures().len(), 1);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error"], "x");
        assert_eq!(json["failed_step"], "provision");
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = E2eConfig::default();
        config.http_retry.max_attempts = 0;
        let runner: Arc<dyn CommandRunner> = Arc::new(crate::shell::SystemRunner);
        assert!(HelloWorldTest::new(config, runner).is_err());
    }
}
