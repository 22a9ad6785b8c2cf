//! JSON-over-HTTP with retry and exponential backoff, shared by the
//! embedding and language-model providers.
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: base × 1, 2, 4, 8, 16, 32 (capped at 2^5)

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

/// Why a request ultimately failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// Retries exhausted on a retryable condition.
    Transient(String),
    /// The server refused the request; retrying will not help.
    Rejected(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

pub fn build_client(timeout_secs: u64) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
}

/// POST `body` to `url` and parse the JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    policy: &RetryPolicy,
) -> Result<Value, HttpFailure> {
    let mut last_err = String::from("no attempt made");

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %last_err, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    debug!(url, %status, "request succeeded");
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| HttpFailure::Rejected(format!("invalid JSON response: {}", e)));
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = format!("HTTP {}: {}", status, body_text);
                    continue;
                }

                return Err(HttpFailure::Rejected(format!("HTTP {}: {}", status, body_text)));
            }
            Err(e) => {
                last_err = format!("connection error: {}", e);
                continue;
            }
        }
    }

    Err(HttpFailure::Transient(last_err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(32));
        assert_eq!(policy.delay(9), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let client = build_client(2).unwrap();
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        };
        let result = post_json(
            &client,
            "http://127.0.0.1:1/v1/embeddings",
            None,
            &serde_json::json!({}),
            &policy,
        )
        .await;
        assert!(matches!(result, Err(HttpFailure::Transient(_))));
    }
}
