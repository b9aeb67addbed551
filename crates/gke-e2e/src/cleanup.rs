//! Deferred teardown actions.
//!
//! Each resource-creating step pushes its inverse onto a [`CleanupStack`]
//! right after it succeeds. At the end of the run, success or failure, the
//! stack is drained in reverse registration order so that workloads are
//! removed before the cluster that hosts them.

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::E2eError;

/// A pending teardown.
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), E2eError>> + Send>;

/// Outcome of one teardown action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupRecord {
    /// Label given at registration.
    pub label: String,
    /// Error message if the action failed.
    pub error: Option<String>,
}

impl CleanupRecord {
    /// Whether the action succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// LIFO stack of teardown actions.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupFn)>,
}

impl CleanupStack {
    /// An empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown action.
    pub fn push<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), E2eError>> + Send + 'static,
    {
        let label = label.into();
        info!(cleanup = %label, "Registered cleanup");
        self.actions.push((label, Box::new(action)));
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Labels in registration order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.actions.iter().map(|(l, _)| l.as_str()).collect()
    }

    /// Run every action, most recent first.
    ///
    /// A failing action is logged and recorded; the remaining actions still
    /// run.
    pub async fn run_all(mut self) -> Vec<CleanupRecord> {
        let mut records = Vec::with_capacity(self.actions.len());

        while let Some((label, action)) = self.actions.pop() {
            info!(cleanup = %label, "Running cleanup");
            let error = match action().await {
                Ok(()) => None,
                Err(e) => {
                    warn!(cleanup = %label, error = %e, "Cleanup failed");
                    Some(e.to_string())
                }
            };
            records.push(CleanupRecord { label, error });
        }

        records
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("actions", &self.labels())
            .finish()
    }
}
