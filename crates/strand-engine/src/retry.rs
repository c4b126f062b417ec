//! Retry strategies used by the state machines.
//!
//! All strategies run a synchronous attempt closure and sleep between
//! attempts with exponential back-off. An attempt reports `Ok(true)` when it
//! succeeded and `Ok(false)` when it should simply be tried again. Every
//! strategy gives up as soon as the shared [`AbortCondition`] is set, which is
//! how closing the stream processor interrupts otherwise endless loops.
//!
//! | Strategy                     | Retries on                  | Used for            |
//! |------------------------------|-----------------------------|---------------------|
//! | [`AbortableRetryStrategy`]   | `Ok(false)`                 | flushes, side effects |
//! | [`EndlessRetryStrategy`]     | `Ok(false)`, any `Err`      | commit, rollback    |
//! | [`RecoverableRetryStrategy`] | `Ok(false)`, recoverable `Err` | replay transactions |

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use strand_config::EngineConfig;

use crate::error::{ProcessingError, StoreError};

// ============================================================================
// Abort Condition
// ============================================================================

/// Shared flag that stops every retry loop once set.
#[derive(Debug, Clone, Default)]
pub struct AbortCondition(Arc<AtomicBool>);

impl AbortCondition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Back-off
// ============================================================================

/// Exponential back-off between retry attempts.
///
/// The delay before retry N is `min(base_delay * 2^(N-1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Errors that a [`RecoverableRetryStrategy`] may retry.
pub trait Recoverable {
    fn is_recoverable(&self) -> bool;
}

impl Recoverable for ProcessingError {
    fn is_recoverable(&self) -> bool {
        matches!(self, ProcessingError::Recoverable(_))
    }
}

impl Recoverable for StoreError {
    fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// Retries while the attempt asks for it; errors end the loop.
///
/// Returns `Ok(true)` on success and `Ok(false)` when aborted or when the
/// optional attempt limit was reached.
#[derive(Debug, Clone)]
pub struct AbortableRetryStrategy {
    backoff: BackoffPolicy,
    abort: AbortCondition,
    max_attempts: Option<u32>,
}

impl AbortableRetryStrategy {
    pub fn new(backoff: BackoffPolicy, abort: AbortCondition) -> Self {
        Self {
            backoff,
            abort,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub async fn run_with_retry<F, E>(&self, mut attempt: F) -> Result<bool, E>
    where
        F: FnMut() -> Result<bool, E>,
    {
        let mut attempts = 0u32;
        loop {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            if attempt()? {
                return Ok(true);
            }
            attempts += 1;
            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Ok(false);
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempts)).await;
        }
    }
}

/// Retries until the attempt succeeds or the abort condition is set.
///
/// Returns `true` on success and `false` only when aborted.
#[derive(Debug, Clone)]
pub struct EndlessRetryStrategy {
    backoff: BackoffPolicy,
    abort: AbortCondition,
}

impl EndlessRetryStrategy {
    pub fn new(backoff: BackoffPolicy, abort: AbortCondition) -> Self {
        Self { backoff, abort }
    }

    pub async fn run_with_retry<F, E>(&self, mut attempt: F) -> bool
    where
        F: FnMut() -> Result<bool, E>,
        E: Display,
    {
        let mut attempts = 0u32;
        loop {
            if self.abort.is_aborted() {
                return false;
            }
            match attempt() {
                Ok(true) => return true,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(attempt = attempts + 1, error = %error, "operation failed, retrying");
                }
            }
            attempts = attempts.saturating_add(1);
            tokio::time::sleep(self.backoff.delay_for_attempt(attempts)).await;
        }
    }
}

/// Retries on `Ok(false)` and on recoverable errors, propagates the rest.
///
/// Returns `Ok(true)` on success and `Ok(false)` when aborted.
#[derive(Debug, Clone)]
pub struct RecoverableRetryStrategy {
    backoff: BackoffPolicy,
    abort: AbortCondition,
}

impl RecoverableRetryStrategy {
    pub fn new(backoff: BackoffPolicy, abort: AbortCondition) -> Self {
        Self { backoff, abort }
    }

    pub async fn run_with_retry<F, E>(&self, mut attempt: F) -> Result<bool, E>
    where
        F: FnMut() -> Result<bool, E>,
        E: Recoverable + Display,
    {
        let mut attempts = 0u32;
        loop {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            match attempt() {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(error) if error.is_recoverable() => {
                    tracing::warn!(attempt = attempts + 1, error = %error, "recoverable failure, retrying");
                }
                Err(error) => return Err(error),
            }
            attempts = attempts.saturating_add(1);
            tokio::time::sleep(self.backoff.delay_for_attempt(attempts)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn abortable_retries_until_success() {
        let strategy = AbortableRetryStrategy::new(fast(), AbortCondition::new());
        let mut calls = 0;

        let result: Result<bool, ()> = strategy
            .run_with_retry(|| {
                calls += 1;
                Ok(calls == 3)
            })
            .await;

        assert_eq!(result, Ok(true));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn abortable_stops_on_error() {
        let strategy = AbortableRetryStrategy::new(fast(), AbortCondition::new());
        let mut calls = 0;

        let result: Result<bool, &str> = strategy
            .run_with_retry(|| {
                calls += 1;
                Err("broken")
            })
            .await;

        assert_eq!(result, Err("broken"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn abortable_respects_attempt_limit() {
        let strategy =
            AbortableRetryStrategy::new(fast(), AbortCondition::new()).with_max_attempts(Some(4));
        let mut calls = 0;

        let result: Result<bool, ()> = strategy
            .run_with_retry(|| {
                calls += 1;
                Ok(false)
            })
            .await;

        assert_eq!(result, Ok(false));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn endless_retries_errors_and_stops_when_aborted() {
        let abort = AbortCondition::new();
        let strategy = EndlessRetryStrategy::new(fast(), abort.clone());
        let mut calls = 0;

        let succeeded = strategy
            .run_with_retry(|| {
                calls += 1;
                if calls == 5 {
                    abort.abort();
                }
                Err::<bool, _>("still down")
            })
            .await;

        assert!(!succeeded);
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn endless_eventually_succeeds() {
        let strategy = EndlessRetryStrategy::new(fast(), AbortCondition::new());
        let mut calls = 0;

        let succeeded = strategy
            .run_with_retry(|| {
                calls += 1;
                if calls < 3 { Err("flaky") } else { Ok(true) }
            })
            .await;

        assert!(succeeded);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn recoverable_propagates_permanent_errors() {
        let strategy = RecoverableRetryStrategy::new(fast(), AbortCondition::new());
        let mut calls = 0;

        let result = strategy
            .run_with_retry(|| {
                calls += 1;
                if calls == 1 {
                    Err(ProcessingError::recoverable("lock held"))
                } else {
                    Err(ProcessingError::failed("bad input"))
                }
            })
            .await;

        assert_eq!(result, Err(ProcessingError::Failed("bad input".into())));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn aborted_strategies_never_run_the_attempt() {
        let abort = AbortCondition::new();
        abort.abort();
        let mut calls = 0;

        let result: Result<bool, ()> = AbortableRetryStrategy::new(fast(), abort.clone())
            .run_with_retry(|| {
                calls += 1;
                Ok(true)
            })
            .await;

        assert_eq!(result, Ok(false));
        assert_eq!(calls, 0);
    }
}
