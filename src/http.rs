//! Shared HTTP retry policy for remote collaborators.
//!
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, ... capped at 32s

use anyhow::{anyhow, Result};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// A non-success response that was not retried (or ran out of retries).
#[derive(Debug, Error)]
#[error("{label} failed (HTTP {status}): {body}")]
pub struct HttpStatusError {
    pub label: String,
    pub status: StatusCode,
    pub body: String,
}

/// Status code of the final response behind `err`, if it got that far.
pub fn status_of(err: &anyhow::Error) -> Option<StatusCode> {
    err.downcast_ref::<HttpStatusError>().map(|e| e.status)
}

/// Send the request built by `build` until it succeeds or retries run out.
///
/// `build` is called once per attempt so per-attempt state (signatures,
/// timestamps) is fresh.
pub async fn send_with_retry<F>(
    label: &str,
    max_retries: u32,
    mut build: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> Result<reqwest::RequestBuilder>,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(label, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build()?.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body = response.text().await.unwrap_or_default();
                let body: String = body.chars().take(500).collect();
                let err = HttpStatusError {
                    label: label.to_string(),
                    status,
                    body,
                };
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    last_err = Some(err.into());
                    continue;
                }
                return Err(err.into());
            }
            Err(e) => {
                last_err = Some(anyhow!("{} failed: {}", label, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} failed after retries", label)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn status_is_recoverable_from_error() {
        let err: anyhow::Error = HttpStatusError {
            label: "Graph download".to_string(),
            status: StatusCode::FORBIDDEN,
            body: "accessDenied".to_string(),
        }
        .into();
        assert_eq!(status_of(&err), Some(StatusCode::FORBIDDEN));
        assert_eq!(err.to_string(), "Graph download failed (HTTP 403 Forbidden): accessDenied");
        assert_eq!(status_of(&anyhow!("connection reset")), None);
    }

    #[tokio::test]
    async fn network_errors_are_retried() {
        let client = reqwest::Client::new();
        let attempts = AtomicU32::new(0);
        // Nothing listens on port 1.
        let err = send_with_retry("local request", 1, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(client.get("http://127.0.0.1:1/"))
        })
        .await
        .unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(status_of(&err).is_none());
    }
}
