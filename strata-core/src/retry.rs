//! Retry logic with exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use crate::provider::{ProviderError, ProviderResult};

/// Backoff schedule for provider calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        // Overflow or a nonsensical multiplier saturates at the cap
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Which errors a call may be retried on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// Mutating calls: only errors the provider classifies as transient
    Transient,
    /// Idempotent reads: any error
    Any,
}

impl RetryOn {
    fn should_retry(self, error: &ProviderError) -> bool {
        match self {
            RetryOn::Transient => error.is_transient(),
            RetryOn::Any => true,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    retry_on: RetryOn,
    label: &str,
    mut operation: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !retry_on.should_retry(&e) || attempt + 1 >= max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                log::warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    label,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
