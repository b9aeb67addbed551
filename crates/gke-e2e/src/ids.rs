//! Per-run identifiers.
//!
//! Every run names its cluster and namespace with a fresh random token so
//! that concurrent runs never contend over the same resources.

use std::fmt;

use uuid::Uuid;

use crate::error::{E2eError, Result};

/// Length of the random token embedded in resource names.
pub const UNIQUE_ID_LEN: usize = 6;

/// Maximum length of a Kubernetes namespace (RFC 1123 label).
const MAX_LABEL_LEN: usize = 63;

/// Generate a short, lowercase, alphanumeric token.
#[must_use]
pub fn unique_id() -> String {
    Uuid::new_v4().simple().to_string()[..UNIQUE_ID_LEN].to_string()
}

/// Unique suffix for this run's resource names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(unique_id())
    }

    /// Name of the cluster for this run, e.g. `test-1a2b3c`.
    #[must_use]
    pub fn cluster_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.0)
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated namespace name, unique to one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceName(String);

impl NamespaceName {
    /// Generate `"{prefix}-{token}"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix makes the name invalid (e.g. uppercase).
    pub fn generate(prefix: &str) -> Result<Self> {
        Self::parse(format!("{prefix}-{}", unique_id()))
    }

    /// Validate an existing name against the RFC 1123 label rules.
    ///
    /// Uppercase input is rejected rather than lowercased.
    ///
    /// # Errors
    ///
    /// Returns [`E2eError::InvalidIdentifier`] describing the first violated rule.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let invalid = |reason: &str| E2eError::InvalidIdentifier {
            value: value.clone(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if value.len() > MAX_LABEL_LEN {
            return Err(invalid("must be at most 63 characters"));
        }
        if value.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("must be lowercase"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid(
                "may only contain lowercase alphanumerics and '-'",
            ));
        }
        if value.starts_with('-') || value.ends_with('-') {
            return Err(invalid("must start and end with an alphanumeric"));
        }

        Ok(Self(value))
    }

    /// The namespace name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
