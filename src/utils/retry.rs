//! Bounded retry with exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// How many times, and how patiently, an operation is attempted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `retries` additional attempts after the first.
    #[must_use]
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            ..Default::default()
        }
    }

    /// Single attempt, no retry.
    #[must_use]
    pub fn none() -> Self {
        Self::with_retries(0)
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.multiplier).min(self.max_delay)
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    Failed { last_error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Failed { last_error, .. } => Err(last_error),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. } | RetryOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Classifies errors that are worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or the policy is exhausted.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => return RetryOutcome::Success { value, attempts },
            Err(error) => {
                if attempts >= max_attempts || !error.is_retryable() {
                    return RetryOutcome::Failed {
                        last_error: error,
                        attempts,
                    };
                }

                let wait = delay + Duration::from_millis(jitter_ms(delay.as_millis() as u64 / 4));
                tracing::warn!(
                    operation = label,
                    attempt = attempts,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                sleep(wait).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

fn jitter_ms(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    // Low bits of a random UUID are plenty for spreading retries apart.
    (uuid::Uuid::new_v4().as_u128() as u64) % max
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.0.contains("transient")
        }
    }

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy::with_retries(retries).with_initial_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let counter = AtomicU32::new(0);
        let outcome = with_retry(&fast(2), "test", || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TestError>("ok")
        })
        .await;

        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.into_result().unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let outcome = with_retry(&fast(2), "test", || async {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError("transient"))
            } else {
                Ok("ok")
            }
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Success { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let outcome = with_retry(&fast(5), "test", || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError("permanent"))
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let counter = AtomicU32::new(0);
        let outcome = with_retry(&fast(2), "test", || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError("transient"))
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 3, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let counter = AtomicU32::new(0);
        let _ = with_retry(&RetryPolicy::none(), "test", || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError("transient"))
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
