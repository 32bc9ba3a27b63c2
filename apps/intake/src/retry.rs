use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable: Sized {
    fn is_retryable(&self) -> bool;

    /// The error recorded when an attempt exceeds the call timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Bounded exponential backoff with a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based): nothing, base, 2x base, 4x base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base_delay
            .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. Timeouts are retried like any retryable error.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error: Option<E> = None;

        for attempt in 0..attempts {
            if let Some(err) = &last_error {
                let delay = self.backoff(attempt);
                warn!(
                    "{what} attempt {attempt} failed ({err}), retrying after {}ms...",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_retryable() => last_error = Some(err),
                Ok(Err(err)) => return Err(err),
                Err(_) => last_error = Some(E::timed_out(self.call_timeout)),
            }
        }

        // attempts >= 1, so at least one error was recorded
        Err(last_error.unwrap_or_else(|| E::timed_out(self.call_timeout)))
    }
}
