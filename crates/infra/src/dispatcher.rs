//! Retry-until-consistent dispatcher.
//!
//! A record written to the store may not be readable yet when its queue
//! message is already claimable. The dispatcher re-runs a read while it
//! reports a retryable (not-found) failure, up to a bounded number of
//! attempts, and reports exhaustion as a distinct outcome so callers can
//! downgrade it instead of surfacing the underlying not-found.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use jobwarden_core::JobError;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every attempt
    Fixed,
    /// Delay doubles after every attempt, up to the cap
    #[default]
    Exponential,
}

/// Bounded retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (at least 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(100), Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed), never above
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(doublings) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => 1u32
                .checked_shl(doublings)
                .and_then(|factor| self.base_delay.checked_mul(factor))
                .unwrap_or(Duration::MAX),
        };
        delay.min(self.max_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Classifies an operation failure as worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for JobError {
    fn is_retryable(&self) -> bool {
        JobError::is_retryable(self)
    }
}

/// Outcome of a dispatch that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError<E> {
    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// An attempt failed with a non-retryable error.
    #[error("{0}")]
    Failed(E),
}

/// Runs an operation until it succeeds, fails hard, or the policy runs out.
#[derive(Debug, Clone, Default)]
pub struct RetryDispatcher {
    policy: RetryPolicy,
}

impl RetryDispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatch `operation`, passing the 1-indexed attempt number.
    pub async fn dispatch<T, E, F, Fut>(&self, mut operation: F) -> Result<T, DispatchError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let max_attempts = self.policy.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(DispatchError::Failed(err)),
                Err(err) if attempt >= max_attempts => {
                    warn!(attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(DispatchError::RetriesExhausted { attempts: attempt });
                }
                Err(err) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_is_flat() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(50));
        assert_eq!(fixed.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn late_attempts_saturate_at_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(33), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_not_found() {
        let calls = AtomicU32::new(0);
        let dispatcher = RetryDispatcher::new(RetryPolicy::fixed(5, Duration::from_millis(10)));

        let result = dispatcher
            .dispatch(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(JobError::not_found("job-1"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_reported_distinctly() {
        let dispatcher = RetryDispatcher::new(RetryPolicy::fixed(4, Duration::from_millis(10)));

        let result: Result<(), _> = dispatcher
            .dispatch(|_| async { Err(JobError::not_found("job-1")) })
            .await;

        assert_eq!(result, Err(DispatchError::RetriesExhausted { attempts: 4 }));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let dispatcher = RetryDispatcher::new(RetryPolicy::fixed(5, Duration::from_secs(60)));

        let result: Result<(), _> = dispatcher
            .dispatch(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(JobError::Store("unavailable".into())) }
            })
            .await;

        assert_eq!(
            result,
            Err(DispatchError::Failed(JobError::Store("unavailable".into())))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempt_policy_still_runs_once() {
        let dispatcher = RetryDispatcher::new(RetryPolicy::fixed(0, Duration::ZERO));
        let result: Result<(), _> = dispatcher
            .dispatch(|_| async { Err(JobError::not_found("job-1")) })
            .await;
        assert_eq!(result, Err(DispatchError::RetriesExhausted { attempts: 1 }));
    }

    proptest! {
        #[test]
        fn delays_never_exceed_cap(
            attempt in 1u32..64,
            base_ms in 0u64..5_000,
            cap_ms in 0u64..60_000,
        ) {
            let policy = RetryPolicy::exponential(
                64,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(cap_ms));
        }
    }
}
