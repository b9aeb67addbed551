//! Error types for the end-to-end run.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while provisioning, deploying, verifying or
/// tearing down the hello-world workload.
#[derive(Error, Debug)]
pub enum E2eError {
    /// An external tool could not be started at all.
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external tool exited with a non-zero status.
    #[error("Command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// `terraform apply` (or `init`) failed.
    #[error("Provisioning failed: {0}")]
    Provisioning(#[source] Box<E2eError>),

    /// A provisioning output was missing or not a string.
    #[error("Terraform output `{name}` is unusable: {message}")]
    Output { name: String, message: String },

    /// `gcloud ... get-credentials` failed.
    #[error("Failed to configure cluster credentials: {0}")]
    Credentials(#[source] Box<E2eError>),

    /// A bounded poll ran out of attempts.
    #[error("{description} did not succeed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        description: String,
        attempts: u32,
        last_error: Box<E2eError>,
    },

    /// An external condition was checked and found not yet true.
    #[error("{0}")]
    NotReady(String),

    /// An observed value did not match the expected literal.
    #[error("Assertion failed for {subject}: expected {expected:?}, got {actual:?}")]
    AssertionFailed {
        subject: String,
        expected: String,
        actual: String,
    },

    /// The service has a type we cannot resolve an endpoint for.
    #[error("Service `{service}` has unsupported type `{service_type}`")]
    UnsupportedServiceType {
        service: String,
        service_type: String,
    },

    /// An identifier violated the cluster naming rules.
    #[error("Invalid identifier `{value}`: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error with the offending path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON decoding error.
    #[error("Failed to decode {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// YAML decoding error.
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// Build an I/O error carrying the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a JSON error describing what was being decoded.
    pub fn json(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            what: what.into(),
            source,
        }
    }

    /// Combined stdout and stderr of a failed command, if this is one.
    ///
    /// Used to match tool output against known transient error patterns.
    #[must_use]
    pub fn command_output(&self) -> Option<String> {
        match self {
            Self::CommandFailed { stdout, stderr, .. } => Some(format!("{stdout}\n{stderr}")),
            Self::Provisioning(inner) | Self::Credentials(inner) => inner.command_output(),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = E2eError> = std::result::Result<T, E>;
