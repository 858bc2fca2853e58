//! Bounded exponential backoff for idempotent reads.

use std::future::Future;
use std::time::Duration;

use crate::error::GuardError;

/// Retry policy: `max_attempts` tries, sleeping `base_delay * 2^n` between
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    /// Creates a policy. At least one attempt is always made.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// A policy that tries once.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Maximum number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff after the `retry`-th failure (zero based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }

    /// Runs `op` until it succeeds or the attempts are exhausted.
    ///
    /// Validation errors are returned at once since retrying cannot fix them.
    ///
    /// # Errors
    ///
    /// Returns the last error once every attempt failed.
    pub async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, GuardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GuardError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_validation() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::debug!(what, attempt, ?delay, error = %e, "read failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
