//! Retry policy: bounds every backend call.
//!
//! - each attempt runs under `timeout`; an elapsed timeout counts as a
//!   transient backend error
//! - only `TransientBackend` is retried, with exponential backoff + jitter
//! - `StaleState` and other permanent errors return immediately

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::app::config::BackendSettings;
use crate::domain::{GridError, Result};

/// Maximum random jitter added to each backoff step.
const JITTER_MAX_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Cap applied before jitter.
    pub max_delay: Duration,

    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: settings.max_attempts.max(1),
            timeout: settings.timeout,
        }
    }

    /// Single attempt, no backoff. Still bounded by `timeout`.
    pub fn once(timeout: Duration) -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: 1,
            timeout,
        }
    }

    /// Delay before retry number `attempts` (1-indexed), without jitter.
    ///
    /// delay = min(base_delay * multiplier^(attempts - 1), max_delay)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay_secs).min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MAX_MS))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn call<T, F, Fut>(&self, backend: &'static str, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(self.timeout, f()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GridError::transient(
                    backend,
                    format!("{op} timed out after {:?}", self.timeout),
                )),
            };
            match outcome {
                Err(err) if err.is_transient() && attempts < self.max_attempts => {
                    let delay = self.next_delay(attempts) + self.jitter();
                    tracing::debug!(
                        backend,
                        op,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backend error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&BackendSettings {
            timeout: Duration::from_millis(5000),
            max_attempts: 4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskStatus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use ulid::Ulid;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts,
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn exponential_backoff_increases_until_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
        assert_eq!(policy.next_delay(30), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = fast(4)
            .call("queue", "send", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GridError::transient("queue", "throttled"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = fast(3)
            .call("queue", "send", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GridError::transient("queue", "down"))
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stale_state_is_never_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = fast(4)
            .call("store", "cas", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GridError::StaleState {
                    task_id: TaskId::from_ulid(Ulid::new()),
                    expected: TaskStatus::Running,
                    actual: TaskStatus::Cancelled,
                })
            })
            .await
            .unwrap_err();

        assert!(err.is_stale_state());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_becomes_transient_error() {
        let err = RetryPolicy::once(Duration::from_millis(10))
            .call("blob", "get", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GridError::TransientBackend { backend: "blob", .. }));
    }
}
