//! Integration tests for the hello-world run.
//!
//! These drive the full orchestrator against a scripted command runner that
//! stands in for terraform, gcloud and kubectl, and a real HTTP server that
//! stands in for the deployed workload's load balancer.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{routing::get, Router};
use gke_e2e::{
    CommandOutput, CommandRunner, E2eConfig, E2eError, HelloWorldTest, PollConfig, RunReport,
    ShellCommand, Step,
};
use tempfile::TempDir;
use tokio::net::TcpListener;

// =============================================================================
// Scripted runner
// =============================================================================

/// Records every command and answers like the real CLIs would.
struct ScriptedRunner {
    calls: Mutex<Vec<ShellCommand>>,
    /// `(program, args)` patterns that fail.
    failures: Vec<(&'static str, Vec<&'static str>)>,
    /// Whether the service ever gets a load balancer ingress.
    service_ready: bool,
    service_port: u16,
}

impl ScriptedRunner {
    fn new(service_port: u16) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Vec::new(),
            service_ready: true,
            service_port,
        }
    }

    fn failing(mut self, program: &'static str, args: &[&'static str]) -> Self {
        self.failures.push((program, args.to_vec()));
        self
    }

    fn service_never_ready(mut self) -> Self {
        self.service_ready = false;
        self
    }

    fn calls(&self) -> Vec<ShellCommand> {
        self.calls.lock().unwrap().clone()
    }

    fn called(&self, program: &str, args: &[&str]) -> bool {
        self.calls()
            .iter()
            .any(|c| c.program == program && c.has_args(args))
    }

    fn position(&self, program: &str, args: &[&str]) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.program == program && c.has_args(args))
    }

    fn nodes_json() -> String {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [{
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": { "name": "gke-test-default-pool-1" },
                "status": {
                    "conditions": [{ "type": "Ready", "status": "True" }],
                    "addresses": [{ "type": "ExternalIP", "address": "127.0.0.1" }]
                }
            }]
        })
        .to_string()
    }

    fn service_json(&self) -> String {
        let status = if self.service_ready {
            serde_json::json!({ "loadBalancer": { "ingress": [{ "ip": "127.0.0.1" }] } })
        } else {
            serde_json::json!({ "loadBalancer": {} })
        };
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "hello-world-service" },
            "spec": {
                "type": "LoadBalancer",
                "clusterIP": "10.0.0.10",
                "ports": [{ "port": self.service_port, "targetPort": 5000 }]
            },
            "status": status
        })
        .to_string()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &ShellCommand) -> gke_e2e::Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.clone());

        if self
            .failures
            .iter()
            .any(|(program, args)| command.program == *program && command.has_args(args))
        {
            return Err(E2eError::CommandFailed {
                command: command.to_string(),
                status: 1,
                stdout: String::new(),
                stderr: "Error: scripted failure".into(),
            });
        }

        let stdout = match command.program.as_str() {
            "terraform" if command.has_args(&["output"]) => {
                let name = command.args.last().map(String::as_str).unwrap_or_default();
                match name {
                    "cluster_name" => "\"test-cluster\"".to_string(),
                    "region" => "\"europe-west1\"".to_string(),
                    "project" => "\"hello-project\"".to_string(),
                    _ => "null".to_string(),
                }
            }
            "kubectl" if command.has_args(&["get", "nodes"]) => Self::nodes_json(),
            "kubectl" if command.has_args(&["get", "service"]) => self.service_json(),
            _ => String::new(),
        };

        Ok(CommandOutput::success(stdout))
    }
}

// =============================================================================
// Mock workload
// =============================================================================

/// Start a server answering `GET /` with `body` on a random port.
async fn start_mock_workload(body: &'static str) -> SocketAddr {
    let app = Router::new().route("/", get(move || async move { body }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// A checkout with a Terraform module and manifest in it.
fn checkout() -> TempDir {
    let root = tempfile::tempdir().unwrap();
    let module = root.path().join("terraform");
    std::fs::create_dir_all(&module).unwrap();
    std::fs::write(module.join("main.tf"), "# module\n").unwrap();
    std::fs::write(module.join("varfile.tfvars"), "region = \"europe-west1\"\n").unwrap();
    std::fs::write(
        module.join("hello-world-deployment.yml"),
        "apiVersion: v1\nkind: Service\n",
    )
    .unwrap();
    root
}

fn test_config(root: &Path, port: u16) -> E2eConfig {
    let quick = PollConfig::new(3, Duration::from_millis(10));
    let mut config = E2eConfig::with_defaults(root);
    config.terraform_retry = quick;
    config.nodes_ready = quick;
    config.service_available = quick;
    config.http_retry = quick;
    config.http_timeout = Duration::from_secs(2);
    config.service_port = port;
    config
}

async fn run(config: E2eConfig, runner: &Arc<ScriptedRunner>) -> RunReport {
    let dyn_runner: Arc<dyn CommandRunner> = runner.clone();
    HelloWorldTest::new(config, dyn_runner)
        .unwrap()
        .run()
        .await
}

fn cleanup_labels(report: &RunReport) -> Vec<String> {
    report.cleanup.iter().map(|c| c.label.clone()).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_successful_run_tears_down_in_reverse_order() {
    let addr = start_mock_workload("Hello world!\n").await;
    let root = checkout();
    let runner = Arc::new(ScriptedRunner::new(addr.port()));

    let report = run(test_config(root.path(), addr.port()), &runner).await;

    assert!(report.is_success(), "run failed: {:?}", report.error);
    assert_eq!(report.steps.len(), usize::from(Step::TOTAL_STEPS));
    assert!(report.failed_step.is_none());
    assert_eq!(
        report.endpoint.as_deref(),
        Some(format!("127.0.0.1:{}", addr.port()).as_str())
    );

    let namespace = report.namespace.clone().unwrap();
    assert!(namespace.starts_with("ns-"));

    let labels = cleanup_labels(&report);
    assert_eq!(labels.len(), 3);
    assert!(labels[0].starts_with("Delete manifest"));
    assert_eq!(labels[1], format!("Delete namespace {namespace}"));
    assert_eq!(labels[2], "Destroy infrastructure");
    assert!(report.cleanup_failures().is_empty());

    let delete_manifest = runner.position("kubectl", &["delete", "-f"]).unwrap();
    let delete_namespace = runner.position("kubectl", &["delete", "namespace"]).unwrap();
    let destroy = runner.position("terraform", &["destroy"]).unwrap();
    assert!(delete_manifest < delete_namespace);
    assert!(delete_namespace < destroy);
    assert_eq!(destroy, runner.calls().len() - 1);
}

#[tokio::test]
async fn test_run_passes_cluster_name_and_isolated_kubeconfig() {
    let addr = start_mock_workload("Hello world!").await;
    let root = checkout();
    let runner = Arc::new(ScriptedRunner::new(addr.port()));

    let report = run(test_config(root.path(), addr.port()), &runner).await;
    assert!(report.is_success());

    let calls = runner.calls();
    let apply = calls
        .iter()
        .find(|c| c.program == "terraform" && c.has_args(&["apply"]))
        .unwrap();
    let cluster_var = format!("gke-name={}", report.cluster_name);
    assert!(apply.has_args(&["-var", cluster_var.as_str()]));
    assert!(apply.has_args(&["-var-file", "varfile.tfvars"]));

    // Terraform ran against a temp copy, never the checkout itself.
    let workdir: PathBuf = apply.working_dir.clone().unwrap();
    assert_ne!(workdir, root.path().join("terraform"));
    assert!(!workdir.exists(), "temp copy should be removed after the run");

    let gcloud = calls.iter().find(|c| c.program == "gcloud").unwrap();
    assert!(gcloud.has_args(&["get-credentials", "test-cluster"]));
    let kubeconfig = PathBuf::from(gcloud.env.get("KUBECONFIG").unwrap());
    assert!(kubeconfig.starts_with(&workdir));

    let create_ns = calls
        .iter()
        .find(|c| c.program == "kubectl" && c.has_args(&["create", "namespace"]))
        .unwrap();
    assert!(create_ns.has_args(&["--context", "gke_hello-project_europe-west1_test-cluster"]));
}

#[tokio::test]
async fn test_manifest_failure_still_deletes_namespace_and_destroys() {
    let addr = start_mock_workload("Hello world!").await;
    let root = checkout();
    let runner = Arc::new(ScriptedRunner::new(addr.port()).failing("kubectl", &["apply", "-f"]));

    let report = run(test_config(root.path(), addr.port()), &runner).await;

    assert!(!report.is_success());
    assert_eq!(report.failed_step, Some(Step::ApplyManifest));
    assert!(report.completed(Step::CreateNamespace));
    assert!(!runner.called("kubectl", &["get", "service"]));

    let labels = cleanup_labels(&report);
    assert_eq!(labels.len(), 2);
    assert!(labels[0].starts_with("Delete namespace"));
    assert_eq!(labels[1], "Destroy infrastructure");
    assert!(!runner.called("kubectl", &["delete", "-f"]));
    assert!(runner.called("terraform", &["destroy"]));
}

#[tokio::test]
async fn test_service_never_available_skips_endpoint_and_http() {
    let root = checkout();
    let runner = Arc::new(ScriptedRunner::new(80).service_never_ready());

    let report = run(test_config(root.path(), 80), &runner).await;

    assert_eq!(report.failed_step, Some(Step::WaitServiceAvailable));
    assert!(report.endpoint.is_none());
    match report.error.as_ref().unwrap() {
        E2eError::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(report.cleanup.len(), 3);
    assert!(report.cleanup_failures().is_empty());
}

#[tokio::test]
async fn test_cleanup_failure_does_not_mask_primary_error() {
    let addr = start_mock_workload("Hello, World").await;
    let root = checkout();
    let runner = Arc::new(
        ScriptedRunner::new(addr.port()).failing("kubectl", &["delete", "namespace"]),
    );

    let report = run(test_config(root.path(), addr.port()), &runner).await;

    assert_eq!(report.failed_step, Some(Step::VerifyHttp));
    match report.error.as_ref().unwrap() {
        E2eError::AssertionFailed {
            expected, actual, ..
        } => {
            assert_eq!(expected, "200 Hello world!");
            assert_eq!(actual, "200 Hello, World");
        }
        other => panic!("unexpected error: {other}"),
    }

    let failures = report.cleanup_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].label.starts_with("Delete namespace"));
    assert!(runner.called("terraform", &["destroy"]));
    assert!(matches!(
        report.into_result(),
        Err(E2eError::AssertionFailed { .. })
    ));
}

#[tokio::test]
async fn test_failed_apply_still_destroys_infrastructure() {
    let root = checkout();
    let runner = Arc::new(ScriptedRunner::new(80).failing("terraform", &["apply"]));

    let report = run(test_config(root.path(), 80), &runner).await;

    assert_eq!(report.failed_step, Some(Step::Provision));
    assert!(matches!(report.error, Some(E2eError::Provisioning(_))));
    assert_eq!(cleanup_labels(&report), vec!["Destroy infrastructure"]);
    assert!(report.cleanup_failures().is_empty());

    let apply = runner.position("terraform", &["apply"]).unwrap();
    let destroy = runner.position("terraform", &["destroy"]).unwrap();
    assert!(apply < destroy);
    assert!(runner.calls().iter().all(|c| c.program == "terraform"));
}

#[tokio::test]
async fn test_failed_init_registers_no_cleanup() {
    let root = checkout();
    let runner = Arc::new(ScriptedRunner::new(80).failing("terraform", &["init"]));

    let report = run(test_config(root.path(), 80), &runner).await;

    assert_eq!(report.failed_step, Some(Step::Provision));
    assert!(report.cleanup.is_empty());
    assert!(!runner.called("terraform", &["apply"]));
    assert!(!runner.called("terraform", &["destroy"]));
}

#[tokio::test]
async fn test_unexpected_service_type_fails_before_http() {
    let addr = start_mock_workload("Hello world!").await;
    let root = checkout();
    let runner = Arc::new(ScriptedRunner::new(addr.port()));
    let mut config = test_config(root.path(), addr.port());
    config.expected_service_type = "NodePort".into();

    let report = run(config, &runner).await;

    assert_eq!(report.failed_step, Some(Step::AssertServiceType));
    assert!(report.completed(Step::ResolveEndpoint));
    assert!(!report.completed(Step::VerifyHttp));
    assert_eq!(report.cleanup.len(), 3);
}
