//! Retry-with-backoff for single cart API calls.
//!
//! Attempt 1 runs immediately; attempt `n + 1` waits
//! `base_delay * 2^(n - 1)` after attempt `n` fails. With the defaults that
//! is 1s then 2s, and the third failure is returned to the caller.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CartError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Delay before the attempt following `failed_attempt` (1-based).
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn worst_case_wait(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.backoff_delay(a)).sum()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. The terminal error is always returned.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, CartError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CartError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = label, attempt, "cart request succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                debug!(op = label, attempt, error = %e, "cart request failed, not retryable");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(op = label, attempts = attempt, error = %e, "cart request failed, giving up");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "cart request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
