//! Bounded retry for device round trips.
//!
//! Corrupted exchanges (CRC mismatch, truncated reply) and unacknowledged
//! writes are retried a fixed number of times with a constant delay.

use std::future::Future;
use std::time::Duration;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use barcal_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(200));
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts, 200 ms apart: the write policy the bar firmware tolerates.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Policy with explicit attempts and delay.
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
        }
    }

    /// Runs `op` until it succeeds or attempts run out; returns the last error.
    ///
    /// `operation` names the action in the retry warning.
    pub async fn run<F, Fut, T, E>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                    tracing::warn!(
                        target: "barcal::retry",
                        attempt,
                        max_attempts,
                        "Operation '{}' failed: {}. Retrying in {:?}",
                        operation,
                        err,
                        self.backoff_delay
                    );
                    tokio::time::sleep(self.backoff_delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        let result: Result<u32, String> = policy
            .run("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {}", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let result: Result<(), String> = policy
            .run("always", |attempt| async move { Err(format!("fail {}", attempt)) })
            .await;
        assert_eq!(result.unwrap_err(), "fail 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        let result: Result<u8, &str> = policy.run("once", |_| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
