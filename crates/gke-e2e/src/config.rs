//! Run configuration.
//!
//! Every literal the run depends on (paths, names, expected values, poll
//! budgets) lives here so that a YAML file can override it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{E2eError, Result};
use crate::retry::PollConfig;

/// Binaries for the three external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Infrastructure-as-code CLI.
    pub terraform: String,
    /// Cloud CLI used for cluster credentials.
    pub gcloud: String,
    /// Cluster-management CLI.
    pub kubectl: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            terraform: "terraform".into(),
            gcloud: "gcloud".into(),
            kubectl: "kubectl".into(),
        }
    }
}

/// Full configuration for one hello-world run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eConfig {
    // Infrastructure
    /// Terraform module directory; copied to a temp dir per run.
    pub terraform_dir: PathBuf,
    /// Var files, relative to the module directory.
    pub var_files: Vec<String>,
    /// Name of the Terraform variable that receives the cluster name.
    pub cluster_name_var: String,
    /// Prefix for the generated cluster name.
    pub cluster_name_prefix: String,
    /// Pass `-lock=true` to Terraform.
    pub lock: bool,
    /// Retry budget for known-transient Terraform errors.
    pub terraform_retry: PollConfig,

    // Cluster access
    /// File name of the isolated kubeconfig inside the run's temp dir.
    pub kubeconfig_file: String,
    /// Prefix for the generated namespace.
    pub namespace_prefix: String,
    /// Budget for all nodes to report Ready.
    pub nodes_ready: PollConfig,

    // Workload
    /// Manifest applied as-is into the run's namespace.
    pub manifest_path: PathBuf,
    /// Service expected to exist after the manifest is applied.
    pub service_name: String,
    /// Expected `spec.type` of that service.
    pub expected_service_type: String,
    /// Service port the endpoint is resolved for.
    pub service_port: u16,
    /// Budget for the service to become available.
    pub service_available: PollConfig,

    // Verification
    /// Expected HTTP status code.
    pub expected_status: u16,
    /// Expected HTTP body, compared after trimming whitespace.
    pub expected_body: String,
    /// Budget for the HTTP check.
    pub http_retry: PollConfig,
    /// Per-request HTTP timeout.
    #[serde(with = "secs")]
    pub http_timeout: Duration,

    /// Tool binaries.
    pub tools: ToolPaths,
}

impl E2eConfig {
    /// Defaults for a checkout rooted at `base_dir`.
    #[must_use]
    pub fn with_defaults(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        Self {
            terraform_dir: base.join("terraform"),
            var_files: vec!["varfile.tfvars".into()],
            cluster_name_var: "gke-name".into(),
            cluster_name_prefix: "test".into(),
            lock: true,
            // one try plus three retries
            terraform_retry: PollConfig::new(4, Duration::from_secs(5)),
            kubeconfig_file: "kubeconfig".into(),
            namespace_prefix: "ns".into(),
            nodes_ready: PollConfig::new(30, Duration::from_secs(10)),
            manifest_path: base.join("terraform").join("hello-world-deployment.yml"),
            service_name: "hello-world-service".into(),
            expected_service_type: "LoadBalancer".into(),
            service_port: 80,
            service_available: PollConfig::new(10, Duration::from_secs(5)),
            expected_status: 200,
            expected_body: "Hello world!".into(),
            http_retry: PollConfig::new(10, Duration::from_secs(5)),
            http_timeout: Duration::from_secs(10),
            tools: ToolPaths::default(),
        }
    }

    /// Load a YAML config file. Relative paths in the file are resolved
    /// against the file's directory; omitted fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| E2eError::io(path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&content, base)
    }

    /// Parse YAML, resolving relative paths against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or the result is invalid.
    pub fn from_yaml(content: &str, base_dir: &Path) -> Result<Self> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(content)?;
        if value.is_null() {
            value = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }

        // Path defaults are rooted at base_dir, and the default manifest
        // follows a custom terraform_dir.
        let overrides: PartialPaths = serde_yaml::from_value(value.clone())?;
        let defaults = Self::with_defaults(base_dir);
        let mut config = Self {
            terraform_dir: defaults.terraform_dir,
            manifest_path: defaults.manifest_path,
            ..serde_yaml::from_value(value)?
        };
        if let Some(dir) = overrides.terraform_dir {
            config.terraform_dir = resolve(base_dir, &dir);
            if overrides.manifest_path.is_none() {
                config.manifest_path = config.terraform_dir.join("hello-world-deployment.yml");
            }
        }
        if let Some(manifest) = overrides.manifest_path {
            config.manifest_path = resolve(base_dir, &manifest);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise surface mid-run.
    ///
    /// # Errors
    ///
    /// Returns [`E2eError::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        for (name, poll) in [
            ("terraform_retry", &self.terraform_retry),
            ("nodes_ready", &self.nodes_ready),
            ("service_available", &self.service_available),
            ("http_retry", &self.http_retry),
        ] {
            if poll.max_attempts == 0 {
                return Err(E2eError::Config(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
        }

        for (name, prefix) in [
            ("cluster_name_prefix", &self.cluster_name_prefix),
            ("namespace_prefix", &self.namespace_prefix),
        ] {
            if prefix.is_empty() || prefix.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(E2eError::Config(format!(
                    "{name} must be non-empty and lowercase, got {prefix:?}"
                )));
            }
        }

        if self.service_name.is_empty() {
            return Err(E2eError::Config("service_name must not be empty".into()));
        }
        if self.kubeconfig_file.is_empty() {
            return Err(E2eError::Config("kubeconfig_file must not be empty".into()));
        }

        Ok(())
    }
}

impl Default for E2eConfig {
    fn default() -> Self {
        Self::with_defaults(".")
    }
}

/// The path fields as written in the file, before resolution.
#[derive(Debug, Default, Deserialize)]
struct PartialPaths {
    terraform_dir: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
