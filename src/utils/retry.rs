//! Retry utilities for resilient API calls
//! Exponential backoff, transient/terminal error classification and a "stuck" alert

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Errors that know whether another attempt could succeed
pub trait Retryable: std::fmt::Display {
    fn is_retryable(&self) -> bool;
}

/// Retry policy
///
/// `max_attempts: None` retries transient failures forever. An in-flight order
/// must never be silently abandoned, so that is the default.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on attempts, `None` for unbounded
    pub max_attempts: Option<u32>,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Consecutive failures after which the call is reported as stuck
    pub stuck_after: u32,
    stuck_alerts: Arc<AtomicU64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            stuck_after: 20,
            stuck_alerts: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl RetryPolicy {
    /// Unbounded policy with the given delays
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, stuck_after: u32) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms: max_delay_ms.max(initial_delay_ms),
            stuck_after: stuck_after.max(1),
            ..Self::default()
        }
    }

    /// Cap the number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Single attempt, no retry
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            ..Self::default()
        }
    }

    /// How many calls have raised a stuck alert under this policy (shared across clones)
    pub fn stuck_alerts(&self) -> u64 {
        self.stuck_alerts.load(Ordering::Relaxed)
    }

    fn next_delay(&self, delay_ms: u64) -> u64 {
        ((delay_ms as f64 * self.backoff_multiplier) as u64).min(self.max_delay_ms)
    }
}

/// Retry an operation while it fails with a retryable error.
///
/// Non-retryable errors are returned immediately. Transient ones are retried with
/// exponential backoff until success or until `max_attempts` is exhausted.
pub async fn retry_with_policy<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable,
{
    let mut delay_ms = policy.initial_delay_ms;
    let mut attempt: u32 = 0;
    let mut alerted = false;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if let Some(max) = policy.max_attempts {
            if attempt >= max {
                error!("{} failed after {} attempts: {}", operation_name, attempt, err);
                return Err(err);
            }
        }

        if attempt >= policy.stuck_after && !alerted {
            alerted = true;
            policy.stuck_alerts.fetch_add(1, Ordering::Relaxed);
            error!(
                operation = operation_name,
                attempts = attempt,
                "STUCK: {} still failing after {} attempts: {}",
                operation_name,
                attempt,
                err
            );
        }

        warn!(
            "{} failed (attempt {}), retrying in {}ms: {}",
            operation_name, attempt, delay_ms, err
        );

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        delay_ms = policy.next_delay(delay_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient"),
                TestError::Fatal => write!(f, "fatal"),
            }
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(1, 4, 3)
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let result = retry_with_policy("test", &fast(), || async { Ok::<i32, TestError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = AtomicU32::new(0);

        let result = retry_with_policy("test", &fast(), || async {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                Err(TestError::Transient)
            } else {
                Ok("success")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let counter = AtomicU32::new(0);

        let result: Result<(), TestError> = retry_with_policy("test", &fast(), || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Fatal)
        })
        .await;

        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_attempts_exhausted() {
        let counter = AtomicU32::new(0);
        let policy = fast().with_max_attempts(3);

        let result: Result<(), TestError> = retry_with_policy("test", &policy, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Transient)
        })
        .await;

        assert_err!(result);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stuck_alert_raised_once_per_call() {
        let counter = AtomicU32::new(0);
        let policy = fast();

        let result = retry_with_policy("test", &policy, || async {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count < 6 {
                Err(TestError::Transient)
            } else {
                Ok(())
            }
        })
        .await;

        assert_ok!(result);
        assert_eq!(policy.stuck_alerts(), 1);
        assert_eq!(policy.clone().stuck_alerts(), 1);
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy::new(100, 250, 5);
        assert_eq!(policy.next_delay(100), 200);
        assert_eq!(policy.next_delay(200), 250);
        assert_eq!(policy.next_delay(250), 250);
    }
}
