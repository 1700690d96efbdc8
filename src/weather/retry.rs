//! Retry/backoff policy shared by provider calls.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

use crate::config::RetryConfig;

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("provider returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RetryError {
    /// Not worth retrying (bad credential).
    #[error("non-retryable failure: {0}")]
    Fatal(AttemptError),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: AttemptError },
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Fatal,
    RateLimited,
    Transient,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_seconds),
        }
    }

    pub fn classify(&self, error: &AttemptError) -> Verdict {
        match error {
            AttemptError::Status { status, .. } if *status == StatusCode::UNAUTHORIZED => {
                Verdict::Fatal
            }
            AttemptError::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
                Verdict::RateLimited
            }
            _ => Verdict::Transient,
        }
    }

    /// `base * 2^attempt`, capped. With a 1s base this is `2^attempt` seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempt = 0u32;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let delay = match self.classify(&error) {
                Verdict::Fatal => return Err(RetryError::Fatal(error)),
                Verdict::RateLimited => {
                    warn!(
                        label,
                        attempt,
                        cooldown_ms = self.rate_limit_cooldown.as_millis() as u64,
                        "Rate limited by provider, cooling down"
                    );
                    self.rate_limit_cooldown
                }
                Verdict::Transient => {
                    let delay = self.backoff(attempt);
                    warn!(
                        label,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    delay
                }
            };

            attempt += 1;
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            tokio::time::sleep(delay).await;
        }
    }
}
