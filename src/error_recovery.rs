//! Bounded retry for instrument transactions.
//!
//! Only transactions that explicitly opt in retry: the bias-block `manipulate` exchange and
//! its numeric getters. Transports, the GPIB bridge, the SCPI facade and the framed ASCII
//! protocol surface the first failure to their caller.

use crate::error::AppResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` below one is raised to one.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number. The backoff is slept between
    /// attempts, never after the last one, and the last error is returned.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => {
                    debug!(attempt, error = %err, "Giving up after final attempt");
                    return Err(err);
                }
                Err(err) => {
                    debug!(
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstrumentError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result = policy
            .retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt >= 2 {
                        Ok(attempt)
                    } else {
                        Err(InstrumentError::DeviceReported("ERROR".into()))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result: AppResult<()> = policy
            .retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InstrumentError::Timeout(Duration::from_millis(5))) }
            })
            .await;

        assert!(matches!(result, Err(InstrumentError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_attempts_is_raised_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
