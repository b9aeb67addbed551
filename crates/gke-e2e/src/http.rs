//! HTTP verification of the deployed workload.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::error::{E2eError, Result};
use crate::retry::PollConfig;

/// Build the client used for verification.
///
/// # Errors
///
/// Returns an error if the client cannot be constructed.
pub fn client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// GET `url`, returning the status code and the body with surrounding
/// whitespace trimmed.
///
/// # Errors
///
/// Returns [`E2eError::Http`] on transport failure.
pub async fn http_get(client: &Client, url: &str) -> Result<(u16, String)> {
    debug!(url, "GET");
    let response = client.get(url).send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok((status, body.trim().to_string()))
}

/// GET `url` until it answers with exactly `expected_status` and
/// `expected_body`, or the attempt budget is spent.
///
/// # Errors
///
/// Returns [`E2eError::AssertionFailed`] carrying the expected values and the
/// last observed response (or transport error).
pub async fn http_get_with_retry(
    client: &Client,
    url: &str,
    expected_status: u16,
    expected_body: &str,
    poll: &PollConfig,
) -> Result<()> {
    let attempts = poll.max_attempts.max(1);
    let mut last_observed = String::new();

    info!(url, expected_status, expected_body, "Verifying HTTP response");

    for attempt in 1..=attempts {
        match http_get(client, url).await {
            Ok((status, body)) if status == expected_status && body == expected_body => {
                info!(url, attempt, status, "HTTP response matched");
                return Ok(());
            }
            Ok((status, body)) => {
                warn!(url, attempt, status, body = %body, "Unexpected HTTP response");
                last_observed = format!("{status} {body}");
            }
            Err(e) => {
                warn!(url, attempt, error = %e, "HTTP request failed");
                last_observed = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(poll.interval).await;
        }
    }

    Err(E2eError::AssertionFailed {
        subject: format!("HTTP GET {url} after {attempts} attempts"),
        expected: format!("{expected_status} {expected_body}"),
        actual: last_observed,
    })
}
