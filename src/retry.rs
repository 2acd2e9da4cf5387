use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total invocations, counting the first try.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows failed attempt `attempt`
    /// (0-indexed): `min(base_delay * 2^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Like `delay_for_attempt`, raised to a server-requested minimum wait
    /// when one was given. The cap still applies; the hint informs the
    /// schedule, it does not override it.
    pub fn delay_with_hint(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match retry_after_secs {
            Some(secs) => computed.max(Duration::from_secs(secs)).min(self.max_delay),
            None => computed,
        }
    }
}

/// Lets the retry loop ask an error whether another attempt is worthwhile.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-requested wait in seconds, when the failure carried one.
    fn retry_after_secs(&self) -> Option<u64> {
        None
    }
}

/// Runs fallible async operations under a bounded-attempt backoff schedule.
///
/// Non-transient errors propagate on first occurrence without spending the
/// remaining attempt budget. Sleeps are cooperative suspension points.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        RetryPolicy { config }
    }

    pub async fn run<T, E, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = self
                        .config
                        .delay_with_hint(attempt, error.retry_after_secs());
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt + 1,
                        self.config.max_attempts,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
        retry_after: Option<u64>,
    }

    impl TestError {
        fn transient() -> Self {
            TestError {
                transient: true,
                retry_after: None,
            }
        }

        fn fatal() -> Self {
            TestError {
                transient: false,
                retry_after: None,
            }
        }
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }

        fn retry_after_secs(&self) -> Option<u64> {
            self.retry_after
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        })
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        };
        let delays: Vec<u64> = (0..5)
            .map(|n| config.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn cap_holds_far_past_the_doubling_range() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(8));
        // Shift overflow territory must still respect the cap.
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(8));
    }

    #[test]
    fn retry_after_hint_raises_but_never_exceeds_the_cap() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(config.delay_with_hint(0, Some(5)), Duration::from_secs(5));
        assert_eq!(config.delay_with_hint(0, Some(60)), Duration::from_secs(8));
        // A hint below the computed delay changes nothing.
        assert_eq!(config.delay_with_hint(3, Some(2)), Duration::from_secs(8));
        assert_eq!(config.delay_with_hint(1, None), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let policy = fast_policy(3);
        let mut calls = 0;
        let result: Result<i32, TestError> = policy
            .run("op", || {
                calls += 1;
                let call = calls;
                async move {
                    if call < 3 {
                        Err(TestError::transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let policy = fast_policy(5);
        let mut calls = 0;
        let result: Result<i32, TestError> = policy
            .run("op", || {
                calls += 1;
                async { Err(TestError::fatal()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1, "fatal error must short-circuit the budget");
    }

    #[tokio::test]
    async fn exhausted_budget_returns_the_last_error() {
        let policy = fast_policy(3);
        let mut calls = 0;
        let result: Result<i32, TestError> = policy
            .run("op", || {
                calls += 1;
                async { Err(TestError::transient()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
