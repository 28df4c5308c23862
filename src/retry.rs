//! Bounded exponential backoff for outbound calls to QuickBooks.
//!
//! Connect errors, timeouts and 5xx responses are retried. Anything else,
//! 4xx included, is handed straight back to the caller.

use std::time::Duration;

use reqwest::{RequestBuilder, Response};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Sends once and never retries. For requests that must not be repeated,
    /// like redeeming a single-use authorisation code.
    pub fn single_attempt() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero based), clamped to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Sends the request built by `build` until it succeeds, fails with a
    /// non-retryable outcome, or the retry budget is spent. The last response
    /// is returned as-is, even if it is a 5xx.
    pub async fn send<F>(&self, label: &str, build: F) -> Result<Response, reqwest::Error>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let outcome = build().send().await;

            let retryable = match &outcome {
                Ok(res) => res.status().is_server_error(),
                Err(err) => is_transient(err),
            };

            if !retryable || attempt >= self.max_retries {
                return outcome;
            }

            let delay = self.delay_for(attempt);
            match &outcome {
                Ok(res) => tracing::warn!(
                    "{} returned status_code={}, retrying in {:?} (attempt {}/{})",
                    label,
                    res.status(),
                    delay,
                    attempt + 1,
                    self.max_retries
                ),
                Err(err) => tracing::warn!(
                    "{} failed: {}, retrying in {:?} (attempt {}/{})",
                    label,
                    err,
                    delay,
                    attempt + 1,
                    self.max_retries
                ),
            }

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
