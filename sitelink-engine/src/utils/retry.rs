//! Store Retry Logic
//!
//! Exponential backoff with jitter for transient datastore failures
//! (timeouts, lock contention, connection resets). Anything else fails
//! immediately: retrying a rejected write in the same shape cannot help.

use crate::error::{StoreError, StoreResult};
use rand::Rng;
use sitelink_common::config::ApplierConfig;
use std::future::Future;
use std::time::{Duration, Instant};

/// Backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ApplierConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// capped, plus up to one base interval of jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let base_ms = self.base_backoff.as_millis() as u64;
        let jitter_ms = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        delay + Duration::from_millis(jitter_ms)
    }
}

/// Retry a store operation while it fails transiently.
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If the error is transient and attempts remain: log WARN, back off, retry
/// 4. If attempts are exhausted: log ERROR, return the last error
/// 5. If the error is not transient: return it immediately
///
/// # Arguments
/// * `operation_name` - Name for logging (e.g., "insert entities batch")
/// * `policy` - Attempt count and backoff bounds
/// * `operation` - Async closure performing the store call
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let start_time = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        if attempt > 1 {
            tracing::debug!(operation = operation_name, attempt, "Retrying store operation");
        }

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        error = %err,
                        "Store operation failed: retries exhausted"
                    );
                    return Err(StoreError::Transient(format!(
                        "{} failed after {} attempts: {}",
                        operation_name, attempt, err
                    )));
                }

                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient store failure, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
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
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let result = retry_transient("test_op", fast_policy(3), || async {
            Ok::<i32, StoreError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = retry_transient("test_op", fast_policy(5), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(StoreError::Transient("database is locked".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: StoreResult<()> = retry_transient("test_op", fast_policy(4), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("timeout".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejected_fails_immediately() {
        let attempts = AtomicU32::new(0);
        let result: StoreResult<()> = retry_transient("test_op", fast_policy(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::Rejected {
                    key: None,
                    reason: "constraint".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Rejected { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));
        let tenth = policy.backoff(10);
        assert!(tenth >= Duration::from_millis(500) && tenth < Duration::from_millis(600));
    }
}
