//! GKE credentials via the gcloud CLI.

use std::path::Path;

use tracing::info;

use crate::error::{E2eError, Result};
use crate::shell::{CommandRunner, ShellCommand};
use crate::terraform::ProvisioningOutputs;

/// Build `gcloud beta container clusters get-credentials ...` writing to an
/// isolated kubeconfig (never the caller's default).
#[must_use]
pub fn get_credentials_command(
    binary: &str,
    outputs: &ProvisioningOutputs,
    kubeconfig: &Path,
) -> ShellCommand {
    ShellCommand::new(binary)
        .args(["beta", "container", "clusters", "get-credentials"])
        .arg(&outputs.cluster_name)
        .arg("--region")
        .arg(&outputs.region)
        .arg("--project")
        .arg(&outputs.project)
        .env("KUBECONFIG", kubeconfig.display().to_string())
}

/// Fetch cluster credentials into `kubeconfig`.
///
/// # Errors
///
/// Returns [`E2eError::Credentials`] if gcloud fails.
pub async fn get_credentials(
    runner: &dyn CommandRunner,
    binary: &str,
    outputs: &ProvisioningOutputs,
    kubeconfig: &Path,
) -> Result<()> {
    info!(
        cluster = %outputs.cluster_name,
        region = %outputs.region,
        project = %outputs.project,
        kubeconfig = %kubeconfig.display(),
        "Fetching cluster credentials"
    );

    runner
        .run(&get_credentials_command(binary, outputs, kubeconfig))
        .await
        .map_err(|e| E2eError::Credentials(Box::new(e)))?;

    Ok(())
}

/// Context name gcloud writes for a GKE cluster: `gke_{project}_{region}_{cluster}`.
#[must_use]
pub fn context_name(outputs: &ProvisioningOutputs) -> String {
    format!(
        "gke_{}_{}_{}",
        outputs.project, outputs.region, outputs.cluster_name
    )
}
