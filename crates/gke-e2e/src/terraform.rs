//! Terraform provisioning.
//!
//! This module handles:
//! - Copying the module into an isolated temp dir per run
//! - `init` + `apply` with retries on known-transient errors
//! - Reading named string outputs
//! - `destroy`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::error::{E2eError, Result};
use crate::retry::{retry_on_known_errors, PollConfig, RetryableErrors};
use crate::shell::{CommandRunner, ShellCommand};

/// Entries never copied into the per-run working dir, at any depth.
const SKIPPED_FILES: &[&str] = &[
    "terraform.tfstate",
    "terraform.tfstate.backup",
    "terraform.tfvars",
    "terraform.tfvars.json",
];

/// Hidden files that are still copied.
const KEPT_HIDDEN_FILES: &[&str] = &[".terraform-version", ".terraform.lock.hcl"];

/// Copy the Terraform module at `src` into a fresh temp dir.
///
/// Hidden entries (including `.terraform/`, but not the version pin or the
/// provider lock file), local state and local var files are skipped, so
/// concurrent runs never share mutable files. Symlinks are followed and
/// copied as their targets. The returned [`TempDir`] is removed when dropped.
///
/// # Errors
///
/// Returns an error if `src` is not a directory or copying fails.
pub fn copy_folder_to_temp(src: &Path) -> Result<TempDir> {
    if !src.is_dir() {
        return Err(E2eError::Config(format!(
            "Terraform directory {} does not exist",
            src.display()
        )));
    }

    let temp = tempfile::Builder::new()
        .prefix("gke-e2e-")
        .tempdir()
        .map_err(|e| E2eError::io(std::env::temp_dir(), e))?;

    copy_dir_filtered(src, temp.path())?;
    info!(
        source = %src.display(),
        target = %temp.path().display(),
        "Copied Terraform module to temp dir"
    );
    Ok(temp)
}

fn is_copied(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    let hidden = name.starts_with('.') && !KEPT_HIDDEN_FILES.contains(&name.as_ref());
    if hidden || SKIPPED_FILES.contains(&name.as_ref()) {
        debug!(file = %entry.path().display(), "Skipping");
        return false;
    }
    true
}

fn walk_error(src: &Path, e: walkdir::Error) -> E2eError {
    let path = e.path().map_or_else(|| src.to_path_buf(), Path::to_path_buf);
    let message = e.to_string();
    let source = e
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other(message));
    E2eError::io(path, source)
}

fn copy_dir_filtered(src: &Path, dst: &Path) -> Result<()> {
    let walker = WalkDir::new(src)
        .follow_links(true)
        .min_depth(1)
        .into_iter()
        .filter_entry(is_copied);

    for entry in walker {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| E2eError::Config(format!("unexpected path in module: {e}")))?;
        let to = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&to).map_err(|e| E2eError::io(&to, e))?;
        } else {
            std::fs::copy(entry.path(), &to).map_err(|e| E2eError::io(entry.path(), e))?;
        }
    }

    Ok(())
}

/// Inputs to the provisioning step. Immutable once built.
#[derive(Debug, Clone)]
pub struct TerraformOptions {
    /// Directory holding the (copied) module.
    pub dir: PathBuf,
    /// `-var-file` arguments, relative to `dir` or absolute.
    pub var_files: Vec<String>,
    /// `-var` overrides.
    pub vars: BTreeMap<String, String>,
    /// Pass `-lock=true`.
    pub lock: bool,
    /// Terraform binary.
    pub binary: String,
    /// Output patterns that mark a failure as transient.
    pub retryable_errors: RetryableErrors,
    /// Attempt budget for transient failures.
    pub retry: PollConfig,
}

impl TerraformOptions {
    /// Options for `dir` with default retryable errors.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            var_files: Vec::new(),
            vars: BTreeMap::new(),
            lock: true,
            binary: "terraform".into(),
            retryable_errors: RetryableErrors::terraform_defaults(),
            retry: PollConfig::default(),
        }
    }

    /// Add a var file.
    #[must_use]
    pub fn with_var_file(mut self, file: impl Into<String>) -> Self {
        self.var_files.push(file.into());
        self
    }

    /// Set a variable override.
    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Set the locking flag.
    #[must_use]
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Set the Terraform binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Set the retry budget for transient errors.
    #[must_use]
    pub fn with_retry(mut self, retry: PollConfig) -> Self {
        self.retry = retry;
        self
    }

    fn command(&self, subcommand: &str) -> ShellCommand {
        ShellCommand::new(&self.binary)
            .arg(subcommand)
            .current_dir(&self.dir)
            .env("TF_IN_AUTOMATION", "1")
    }

    fn with_var_args(&self, mut cmd: ShellCommand) -> ShellCommand {
        for file in &self.var_files {
            cmd = cmd.arg("-var-file").arg(file);
        }
        for (key, value) in &self.vars {
            cmd = cmd.arg("-var").arg(format!("{key}={value}"));
        }
        cmd.arg(format!("-lock={}", self.lock))
    }

    /// `terraform init -upgrade=false`.
    #[must_use]
    pub fn init_command(&self) -> ShellCommand {
        self.command("init").arg("-upgrade=false")
    }

    /// `terraform apply -input=false -auto-approve <vars> -lock=<lock>`.
    #[must_use]
    pub fn apply_command(&self) -> ShellCommand {
        self.with_var_args(self.command("apply").args(["-input=false", "-auto-approve"]))
    }

    /// `terraform destroy -auto-approve -input=false <vars> -lock=<lock>`.
    #[must_use]
    pub fn destroy_command(&self) -> ShellCommand {
        self.with_var_args(self.command("destroy").args(["-auto-approve", "-input=false"]))
    }

    /// `terraform output -no-color -json <name>`.
    #[must_use]
    pub fn output_command(&self, name: &str) -> ShellCommand {
        self.command("output").args(["-no-color", "-json", name])
    }
}

async fn run_with_retries(
    runner: &dyn CommandRunner,
    options: &TerraformOptions,
    description: &str,
    cmd: ShellCommand,
) -> Result<String> {
    retry_on_known_errors(
        description,
        &options.retry,
        &options.retryable_errors,
        || runner.run(&cmd),
    )
    .await
    .map(|out| out.stdout)
}

/// Run `terraform init`.
///
/// # Errors
///
/// Returns [`E2eError::Provisioning`] if init fails for a reason that is not
/// a known transient, or keeps failing past the retry budget.
pub async fn init(runner: &dyn CommandRunner, options: &TerraformOptions) -> Result<()> {
    info!(dir = %options.dir.display(), "terraform init");
    run_with_retries(runner, options, "terraform init", options.init_command())
        .await
        .map_err(|e| E2eError::Provisioning(Box::new(e)))?;
    Ok(())
}

/// Run `terraform apply`.
///
/// A failed apply may have created part of the module; callers should
/// register [`destroy`] before calling this.
///
/// # Errors
///
/// Returns [`E2eError::Provisioning`] if apply fails for a reason that is not
/// a known transient, or keeps failing past the retry budget.
pub async fn apply(runner: &dyn CommandRunner, options: &TerraformOptions) -> Result<()> {
    info!(vars = ?options.vars, "terraform apply");
    run_with_retries(runner, options, "terraform apply", options.apply_command())
        .await
        .map_err(|e| E2eError::Provisioning(Box::new(e)))?;
    Ok(())
}

/// Run `terraform init` then `terraform apply`.
///
/// # Errors
///
/// Returns [`E2eError::Provisioning`] if either step fails.
pub async fn init_and_apply(runner: &dyn CommandRunner, options: &TerraformOptions) -> Result<()> {
    init(runner, options).await?;
    apply(runner, options).await
}

/// Run `terraform destroy`.
///
/// # Errors
///
/// Returns an error if destroy fails past the retry budget.
pub async fn destroy(runner: &dyn CommandRunner, options: &TerraformOptions) -> Result<()> {
    info!(dir = %options.dir.display(), "terraform destroy");
    run_with_retries(
        runner,
        options,
        "terraform destroy",
        options.destroy_command(),
    )
    .await
    .map(|_| ())
}

/// Read a string output.
///
/// # Errors
///
/// Returns [`E2eError::Output`] if the output is missing or not a string.
pub async fn output(
    runner: &dyn CommandRunner,
    options: &TerraformOptions,
    name: &str,
) -> Result<String> {
    let stdout = runner
        .run(&options.output_command(name))
        .await
        .map_err(|e| E2eError::Output {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    parse_string_output(name, &stdout.stdout)
}

fn parse_string_output(name: &str, raw: &str) -> Result<String> {
    let value: serde_json::Value =
        serde_json::from_str(raw.trim()).map_err(|e| E2eError::Output {
            name: name.to_string(),
            message: format!("not valid JSON: {e}"),
        })?;

    match value {
        serde_json::Value::String(s) if !s.is_empty() => Ok(s),
        serde_json::Value::String(_) => Err(E2eError::Output {
            name: name.to_string(),
            message: "empty string".into(),
        }),
        other => Err(E2eError::Output {
            name: name.to_string(),
            message: format!("expected a string, got {other}"),
        }),
    }
}

/// Values read back from the applied module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningOutputs {
    /// GKE cluster name.
    pub cluster_name: String,
    /// Cluster region.
    pub region: String,
    /// GCP project.
    pub project: String,
}

impl ProvisioningOutputs {
    /// Read the `cluster_name`, `region` and `project` outputs.
    ///
    /// # Errors
    ///
    /// Returns [`E2eError::Output`] for the first unusable output.
    pub async fn read(runner: &dyn CommandRunner, options: &TerraformOptions) -> Result<Self> {
        Ok(Self {
            cluster_name: output(runner, options, "cluster_name").await?,
            region: output(runner, options, "region").await?,
            project: output(runner, options, "project").await?,
        })
    }
}
