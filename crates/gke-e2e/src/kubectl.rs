//! Cluster operations through kubectl.
//!
//! All calls target an explicit context and kubeconfig so a run never
//! touches the caller's current context.

use std::fmt;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{Node, Service, ServicePort};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{E2eError, Result};
use crate::ids::NamespaceName;
use crate::retry::{retry_fixed, PollConfig};
use crate::shell::{CommandRunner, ShellCommand};

/// Credentials and target for kubectl calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubectlOptions {
    /// Context name inside the kubeconfig.
    pub context: String,
    /// Path to the kubeconfig file.
    pub kubeconfig: PathBuf,
    /// Namespace for namespaced calls.
    pub namespace: NamespaceName,
    /// kubectl binary.
    pub binary: String,
}

impl KubectlOptions {
    /// Options for `context` in `kubeconfig`, scoped to `namespace`.
    #[must_use]
    pub fn new(
        context: impl Into<String>,
        kubeconfig: impl Into<PathBuf>,
        namespace: NamespaceName,
    ) -> Self {
        Self {
            context: context.into(),
            kubeconfig: kubeconfig.into(),
            namespace,
            binary: "kubectl".into(),
        }
    }

    /// Set the kubectl binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Command for cluster-scoped resources (nodes, namespaces).
    #[must_use]
    pub fn cluster_command(&self) -> ShellCommand {
        ShellCommand::new(&self.binary)
            .arg("--context")
            .arg(&self.context)
            .arg("--kubeconfig")
            .arg(self.kubeconfig.display().to_string())
    }

    /// Command scoped to the run's namespace.
    #[must_use]
    pub fn namespaced_command(&self) -> ShellCommand {
        self.cluster_command()
            .arg("--namespace")
            .arg(self.namespace.as_str())
    }
}

/// Create the run's namespace.
///
/// # Errors
///
/// Returns an error if kubectl fails.
pub async fn create_namespace(runner: &dyn CommandRunner, options: &KubectlOptions) -> Result<()> {
    info!(namespace = %options.namespace, "Creating namespace");
    runner
        .run(
            &options
                .cluster_command()
                .args(["create", "namespace", options.namespace.as_str()]),
        )
        .await?;
    Ok(())
}

/// Delete the run's namespace.
///
/// # Errors
///
/// Returns an error if kubectl fails.
pub async fn delete_namespace(runner: &dyn CommandRunner, options: &KubectlOptions) -> Result<()> {
    info!(namespace = %options.namespace, "Deleting namespace");
    runner
        .run(
            &options
                .cluster_command()
                .args(["delete", "namespace", options.namespace.as_str()]),
        )
        .await?;
    Ok(())
}

/// `kubectl apply -f <manifest>` into the run's namespace.
///
/// # Errors
///
/// Returns an error if kubectl fails.
pub async fn apply(
    runner: &dyn CommandRunner,
    options: &KubectlOptions,
    manifest: &Path,
) -> Result<()> {
    info!(manifest = %manifest.display(), namespace = %options.namespace, "Applying manifest");
    runner
        .run(
            &options
                .namespaced_command()
                .args(["apply", "-f"])
                .arg(manifest.display().to_string()),
        )
        .await?;
    Ok(())
}

/// `kubectl delete -f <manifest>` from the run's namespace.
///
/// # Errors
///
/// Returns an error if kubectl fails.
pub async fn delete(
    runner: &dyn CommandRunner,
    options: &KubectlOptions,
    manifest: &Path,
) -> Result<()> {
    info!(manifest = %manifest.display(), namespace = %options.namespace, "Deleting manifest");
    runner
        .run(
            &options
                .namespaced_command()
                .args(["delete", "-f"])
                .arg(manifest.display().to_string()),
        )
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<Node>,
}

/// List all nodes in the cluster.
///
/// # Errors
///
/// Returns an error if kubectl fails or the output cannot be decoded.
pub async fn get_nodes(runner: &dyn CommandRunner, options: &KubectlOptions) -> Result<Vec<Node>> {
    let out = runner
        .run(&options.cluster_command().args(["get", "nodes", "-o", "json"]))
        .await?;
    let list: NodeList =
        serde_json::from_str(&out.stdout).map_err(|e| E2eError::json("node list", e))?;
    Ok(list.items)
}

/// Whether `node` has condition `Ready=True`.
#[must_use]
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("<unnamed>")
}

/// Check once that the cluster has nodes and all of them are Ready.
///
/// # Errors
///
/// Returns [`E2eError::NotReady`] listing the nodes that are not ready.
pub async fn all_nodes_ready(runner: &dyn CommandRunner, options: &KubectlOptions) -> Result<()> {
    let nodes = get_nodes(runner, options).await?;
    if nodes.is_empty() {
        return Err(E2eError::NotReady("cluster has no nodes yet".into()));
    }

    let not_ready: Vec<&str> = nodes
        .iter()
        .filter(|n| !is_node_ready(n))
        .map(node_name)
        .collect();
    if not_ready.is_empty() {
        debug!(count = nodes.len(), "All nodes ready");
        Ok(())
    } else {
        Err(E2eError::NotReady(format!(
            "{} of {} nodes not ready: {}",
            not_ready.len(),
            nodes.len(),
            not_ready.join(", ")
        )))
    }
}

/// Poll until every node reports Ready.
///
/// # Errors
///
/// Returns [`E2eError::RetriesExhausted`] if the budget runs out.
pub async fn wait_until_all_nodes_ready(
    runner: &dyn CommandRunner,
    options: &KubectlOptions,
    poll: &PollConfig,
) -> Result<()> {
    info!(
        max_attempts = poll.max_attempts,
        interval_secs = poll.interval.as_secs(),
        "Waiting for nodes to be ready"
    );
    retry_fixed("Wait for all nodes to be ready", poll, || {
        all_nodes_ready(runner, options)
    })
    .await
}

/// Fetch a service from the run's namespace.
///
/// # Errors
///
/// Returns an error if kubectl fails or the output cannot be decoded.
pub async fn get_service(
    runner: &dyn CommandRunner,
    options: &KubectlOptions,
    name: &str,
) -> Result<Service> {
    let out = runner
        .run(
            &options
                .namespaced_command()
                .args(["get", "service", name, "-o", "json"]),
        )
        .await?;
    serde_json::from_str(&out.stdout).map_err(|e| E2eError::json(format!("service {name}"), e))
}

/// `spec.type` of a service; Kubernetes defaults it to `ClusterIP`.
#[must_use]
pub fn service_type(service: &Service) -> &str {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("ClusterIP")
}

fn load_balancer_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress
        .ip
        .clone()
        .filter(|ip| !ip.is_empty())
        .or_else(|| ingress.hostname.clone().filter(|h| !h.is_empty()))
}

/// Whether a service can take traffic.
///
/// Only LoadBalancer services have a provisioning delay: they are available
/// once they have an ingress address. Other types are available as soon as
/// they exist.
#[must_use]
pub fn is_service_available(service: &Service) -> bool {
    match service_type(service) {
        "LoadBalancer" => load_balancer_address(service).is_some(),
        _ => true,
    }
}

/// Poll until the named service exists and is available.
///
/// # Errors
///
/// Returns [`E2eError::RetriesExhausted`] if the budget runs out.
pub async fn wait_until_service_available(
    runner: &dyn CommandRunner,
    options: &KubectlOptions,
    name: &str,
    poll: &PollConfig,
) -> Result<Service> {
    info!(
        service = name,
        max_attempts = poll.max_attempts,
        interval_secs = poll.interval.as_secs(),
        "Waiting for service to be available"
    );
    let description = format!("Wait for service {name} to be available");
    retry_fixed(&description, poll, || async move {
        let service = get_service(runner, options, name).await?;
        if is_service_available(&service) {
            Ok(service)
        } else {
            Err(E2eError::NotReady(format!(
                "service {name} has no load balancer ingress yet"
            )))
        }
    })
    .await
}

/// Externally reachable address of the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// IP address or hostname.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServiceEndpoint {
    /// `http://host:port`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{self}")
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn service_name(service: &Service) -> String {
    service.metadata.name.clone().unwrap_or_default()
}

fn find_port(service: &Service, port: u16) -> Option<&ServicePort> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.port == i32::from(port))
}

fn node_port_for(service: &Service, port: u16) -> Option<u16> {
    find_port(service, port)
        .and_then(|p| p.node_port)
        .and_then(|np| u16::try_from(np).ok())
}

fn require_port(service: &Service, name: &str, port: u16) -> Result<()> {
    match find_port(service, port) {
        Some(_) => Ok(()),
        None => Err(E2eError::Config(format!(
            "service {name} does not expose port {port}"
        ))),
    }
}

fn external_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "ExternalIP")
        .map(|a| a.address.clone())
}

/// Resolve where `port` of an available service can be reached.
///
/// # Errors
///
/// Returns [`E2eError::NotReady`] if the address is not assigned yet,
/// [`E2eError::Config`] if the service does not expose `port`, and
/// [`E2eError::UnsupportedServiceType`] for types without an address.
pub async fn service_endpoint(
    runner: &dyn CommandRunner,
    options: &KubectlOptions,
    service: &Service,
    port: u16,
) -> Result<ServiceEndpoint> {
    let name = service_name(service);
    let endpoint = match service_type(service) {
        "ClusterIP" => {
            require_port(service, &name, port)?;
            let host = service
                .spec
                .as_ref()
                .and_then(|s| s.cluster_ip.clone())
                .ok_or_else(|| E2eError::NotReady(format!("service {name} has no cluster IP")))?;
            ServiceEndpoint { host, port }
        }
        "LoadBalancer" => {
            require_port(service, &name, port)?;
            let host = load_balancer_address(service).ok_or_else(|| {
                E2eError::NotReady(format!("service {name} has no load balancer ingress"))
            })?;
            // A load balancer maps the service port directly.
            ServiceEndpoint { host, port }
        }
        "NodePort" => {
            let node_port = node_port_for(service, port).ok_or_else(|| {
                E2eError::NotReady(format!("service {name} exposes no node port for {port}"))
            })?;
            let nodes = get_nodes(runner, options).await?;
            let host = nodes.iter().find_map(external_ip).ok_or_else(|| {
                E2eError::NotReady("no node has an external IP".into())
            })?;
            ServiceEndpoint {
                host,
                port: node_port,
            }
        }
        other => {
            return Err(E2eError::UnsupportedServiceType {
                service: name,
                service_type: other.to_string(),
            })
        }
    };

    info!(service = %name, endpoint = %endpoint, "Resolved service endpoint");
    Ok(endpoint)
}
