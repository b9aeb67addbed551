//! Bounded, fixed-interval retry loops.
//!
//! Readiness polls and Terraform transients retry a fixed number of times
//! with a fixed sleep in between and no backoff, so every wait is bounded by
//! `max_attempts * interval`.

use std::future::Future;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{E2eError, Result};

/// Attempt budget and delay for one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl PollConfig {
    /// Create a poll budget.
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound on time spent sleeping in this loop.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(5))
    }
}

/// Run `op` until it succeeds or the attempt budget is spent.
///
/// # Errors
///
/// Returns [`E2eError::RetriesExhausted`] wrapping the last failure.
pub async fn retry_fixed<T, F, Fut>(description: &str, config: &PollConfig, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_fixed_if(description, config, |_| true, op).await
}

/// Like [`retry_fixed`], but errors for which `should_retry` returns false
/// are returned immediately and unwrapped.
///
/// # Errors
///
/// Returns the first non-retryable error, or [`E2eError::RetriesExhausted`].
pub async fn retry_fixed_if<T, F, Fut, P>(
    description: &str,
    config: &PollConfig,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&E2eError) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(description, attempt, "Attempting");

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(description, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) if attempt == attempts => {
                return Err(E2eError::RetriesExhausted {
                    description: description.to_string(),
                    attempts,
                    last_error: Box::new(e),
                });
            }
            Err(e) => {
                warn!(
                    description,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    delay_secs = config.interval.as_secs_f64(),
                    "Not yet, retrying"
                );
                tokio::time::sleep(config.interval).await;
            }
        }
    }
}

/// Known-transient tool failures, matched against command output.
#[derive(Debug, Clone)]
pub struct RetryableErrors {
    patterns: Vec<(Regex, String)>,
}

impl RetryableErrors {
    /// An empty set; nothing is retried.
    #[must_use]
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Build a set from `(regex, description)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`E2eError::Config`] if a pattern does not compile.
    pub fn from_pairs<I, P, D>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, D)>,
        P: AsRef<str>,
        D: Into<String>,
    {
        let patterns = pairs
            .into_iter()
            .map(|(pattern, description)| {
                Regex::new(pattern.as_ref())
                    .map(|re| (re, description.into()))
                    .map_err(|e| E2eError::Config(format!("bad retryable pattern: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Transient errors commonly seen from `terraform init/apply/destroy`.
    #[must_use]
    pub fn terraform_defaults() -> Self {
        const NETWORK: &str = "Failed to retrieve plugin due to transient network error.";
        let pairs = [
            (
                r".*read: connection reset by peer.*",
                "Failed to reach helm charts repository.",
            ),
            (r".*transport is closing.*", "Failed to reach Kubernetes API."),
            (r".*unable to verify signature.*", NETWORK),
            (r".*unable to verify checksum.*", NETWORK),
            (r".*no provider exists with the given name.*", NETWORK),
            (r".*registry service is unreachable.*", NETWORK),
            (r".*Error installing provider.*", NETWORK),
            (r".*Failed to query available provider packages.*", NETWORK),
            (r".*timeout while waiting for plugin to start.*", NETWORK),
            (r".*timed out waiting for server handshake.*", NETWORK),
            (r"could not query provider registry for", NETWORK),
            (
                r".*Client\.Timeout exceeded while awaiting headers.*",
                "Client timeout exceeded while awaiting headers.",
            ),
            (
                r"(?s).*Could not download module.*The requested URL returned error: 429.*",
                "Failed to download module due to rate limit.",
            ),
        ];
        Self {
            patterns: pairs
                .iter()
                .filter_map(|(p, d)| Regex::new(p).ok().map(|re| (re, (*d).to_string())))
                .collect(),
        }
    }

    /// Description of the first pattern matching `output`, if any.
    #[must_use]
    pub fn find(&self, output: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(output))
            .map(|(_, description)| description.as_str())
    }

    /// Whether `err` is a command failure whose output is a known transient.
    #[must_use]
    pub fn is_retryable(&self, err: &E2eError) -> bool {
        err.command_output()
            .is_some_and(|output| self.find(&output).is_some())
    }

    /// Number of patterns in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for RetryableErrors {
    fn default() -> Self {
        Self::terraform_defaults()
    }
}

/// Run `op`, retrying only failures whose output matches `errors`.
///
/// # Errors
///
/// Returns the first unrecognised failure, or [`E2eError::RetriesExhausted`].
pub async fn retry_on_known_errors<T, F, Fut>(
    description: &str,
    config: &PollConfig,
    errors: &RetryableErrors,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_fixed_if(
        description,
        config,
        |e| match e.command_output().as_deref().and_then(|o| errors.find(o)) {
            Some(reason) => {
                warn!(description, reason, "Known transient error");
                true
            }
            None => false,
        },
        op,
    )
    .await
}

/// Durations as (fractional) seconds in config files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn failed(stderr: &str) -> E2eError {
        E2eError::CommandFailed {
            command: "terraform apply".into(),
            status: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = PollConfig::new(5, Duration::from_secs(5));
        let value = retry_fixed("thing", &config, || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(E2eError::NotReady("not yet".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = PollConfig::new(3, Duration::from_secs(1));
        let err = retry_fixed("service", &config, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(E2eError::NotReady("pending".into()))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            E2eError::RetriesExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.to_string(), "pending");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_no_backoff() {
        let start = tokio::time::Instant::now();
        let config = PollConfig::new(4, Duration::from_secs(5));
        let _ = retry_fixed("wait", &config, || async {
            Err::<(), _>(E2eError::NotReady("no".into()))
        })
        .await;
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert_eq!(config.max_wait(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let errors = RetryableErrors::terraform_defaults();
        let err = retry_on_known_errors("apply", &PollConfig::default(), &errors, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(failed("Error: invalid value for variable"))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, E2eError::CommandFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_error_is_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let errors = RetryableErrors::terraform_defaults();
        retry_on_known_errors("init", &PollConfig::default(), &errors, || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(failed("Error installing provider \"google\": EOF"))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_terraform_defaults_compile_and_match() {
        let errors = RetryableErrors::terraform_defaults();
        assert_eq!(errors.len(), 13);
        assert!(errors.find("dial tcp: read: connection reset by peer").is_some());
        assert!(errors
            .find("Error: Could not download module\nThe requested URL returned error: 429")
            .is_some());
        assert!(errors.find("Error: Unsupported argument").is_none());
    }

    #[test]
    fn test_from_pairs_rejects_bad_regex() {
        assert!(RetryableErrors::from_pairs([("(", "broken")]).is_err());
        let custom = RetryableErrors::from_pairs([("quota", "Quota hiccup")]).unwrap();
        assert!(custom.is_retryable(&failed("quota exceeded")));
        assert!(!RetryableErrors::none().is_retryable(&failed("quota exceeded")));
    }

    #[test]
    fn test_poll_config_yaml() {
        let config: PollConfig = serde_yaml::from_str("max_attempts: 3\ninterval: 2.5\n").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.interval, Duration::from_millis(2500));
    }
}
