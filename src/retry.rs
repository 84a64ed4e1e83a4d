//! Retry with exponential backoff for extraction calls.

use crate::emit;
use crate::error::ExtractionError;
use crate::metrics::events::ExtractionRetried;
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff schedule for retried extraction attempts.
///
/// The delay before attempt `n + 1` is `initial_delay_ms * backoff_factor^n`
/// capped at `max_delay_ms`, with up to 10% random jitter added when
/// `jitter` is set so parallel extractions do not retry in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for tests and one-shot callers.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent as i32);
        let mut millis = base.min(self.max_delay_ms as f64);
        if self.jitter {
            millis += rand::rng().random_range(0.0..millis * 0.1 + 1.0);
        }
        Duration::from_millis(millis as u64)
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// The terminal error wraps the last attempt's failure in
/// [`ExtractionError::RetryExhausted`] so callers can see both how many
/// attempts were made and what finally went wrong.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    src: &str,
    mut operation: F,
) -> Result<T, ExtractionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExtractionError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    src,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Extraction attempt failed, retrying"
                );
                emit!(ExtractionRetried {
                    source: src.to_string(),
                    attempt,
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(error).context(crate::error::RetryExhaustedSnafu { src, attempts });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 1,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(3), "crm", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                crate::error::SourceSnafu {
                    src: "crm",
                    message: "flaky",
                }
                .fail()
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let result: Result<(), _> = retry_with_backoff(&fast_policy(2), "crm", || async {
            crate::error::SourceSnafu {
                src: "crm",
                message: "down",
            }
            .fail()
        })
        .await;
        match result {
            Err(error @ ExtractionError::RetryExhausted { .. }) => {
                assert_eq!(error.attempts(), 2);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            backoff_factor: 10.0,
            max_delay_ms: 5_000,
            jitter: false,
        };
        assert_eq!(policy.delay_for(5), Duration::from_millis(5_000));
    }
}
