//! Bounded retries around blocking storage calls.
//!
//! Each attempt runs on the blocking pool under a hard timeout. Transient
//! failures back off exponentially; once the budget is spent the caller gets
//! `StorageUnavailable` and the batch fails as a whole.

use std::time::Duration;

use tracing::warn;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Ceiling for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &StorageConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_delay: Duration::from_millis(cfg.retry_initial_ms),
            max_delay: Duration::from_millis(cfg.retry_max_ms),
            multiplier: 2.0,
            timeout: Duration::from_secs(cfg.op_timeout_secs),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Run `op` on the blocking pool with bounded retries.
///
/// Errors that are not storage failures (bad input, decode errors) are
/// returned unchanged on the first attempt.
pub async fn with_retry<T, F>(policy: &RetryPolicy, operation: &'static str, op: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn() -> Result<T> + Clone + Send + 'static,
{
    let attempts_allowed = policy.max_retries + 1;
    let mut last_reason = String::new();

    for attempt in 1..=attempts_allowed {
        if attempt > 1 {
            tokio::time::sleep(policy.delay_for(attempt - 1)).await;
        }

        let call = op.clone();
        let outcome = tokio::time::timeout(policy.timeout, tokio::task::spawn_blocking(call)).await;

        last_reason = match outcome {
            Ok(Ok(Ok(value))) => return Ok(value),
            Ok(Ok(Err(e))) if e.is_transient() => e.to_string(),
            Ok(Ok(Err(e @ Error::Sqlite(_)))) => {
                return Err(Error::StorageUnavailable {
                    operation,
                    attempts: attempt,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(join)) => format!("storage task failed: {join}"),
            Err(_) => format!("timed out after {:?}", policy.timeout),
        };

        warn!(
            operation,
            attempt,
            max_attempts = attempts_allowed,
            reason = %last_reason,
            "storage call failed"
        );
    }

    Err(Error::StorageUnavailable {
        operation,
        attempts: attempts_allowed,
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            timeout: Duration::from_millis(200),
        }
    }

    fn busy() -> Error {
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk busy"))
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(250));
        assert_eq!(p.delay_for(2), Duration::from_millis(500));
        assert_eq!(p.delay_for(3), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(6), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let value = with_retry(&fast_policy(3), "test", move || {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(busy())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_storage_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = with_retry(&fast_policy(2), "persist_event", move || -> Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            Err(busy())
        })
        .await
        .unwrap_err();

        match err {
            Error::StorageUnavailable { operation, attempts, .. } => {
                assert_eq!(operation, "persist_event");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected StorageUnavailable, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hung_call_times_out() {
        let err = with_retry(&fast_policy(0), "fetch_readings_since", || -> Result<()> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_non_storage_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = with_retry(&fast_policy(3), "test", move || -> Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            Err(Error::Config("nope".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
