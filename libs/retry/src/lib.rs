//! Retry counters and bounded backoff.
//!
//! A [`RetryPolicy`] is a small piece of mutable bookkeeping: how many retries
//! have been spent, how many are allowed, and the delay to wait before the
//! next one. The same type backs two very different loops:
//!
//! - storage calls, where [`run_policy`] re-invokes a fallible operation until
//!   it succeeds or the policy is spent;
//! - task rescheduling, where the scheduler keeps one policy per task and
//!   calls [`RetryPolicy::advance`] every time the task fails.
//!
//! # Invariants
//!
//! - The delay returned by [`RetryPolicy::advance`] always lies within the
//!   policy's `[min_delay, max_delay]` bounds.
//! - Once `total_retries == max_retries` the policy is exhausted and
//!   `advance` returns `None` until [`RetryPolicy::reset`] is called.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Default lower bound for a retry delay.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(50);

/// Default upper bound for a retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Errors that know whether repeating the failed call could help.
pub trait Retryable {
    /// Returns true if the operation may succeed when attempted again.
    fn is_retryable(&self) -> bool;
}

/// Terminal outcome of [`run_policy`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The policy ran out of retries; `last` is the final failure.
    #[error("gave up after {retries} retries: {last}")]
    Exhausted { retries: u32, last: E },

    /// The failure was not retryable and was returned on first sight.
    #[error(transparent)]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// Returns the underlying error, discarding the retry count.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent(e) => e,
        }
    }

    /// Returns true if the policy was spent.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Retry bookkeeping for one operation or one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries spent so far.
    pub total_retries: u32,

    /// Retries allowed before the policy is exhausted.
    pub max_retries: u32,

    /// Delay before the next retry.
    pub retry_time: Duration,

    /// Double `retry_time` on every retry when true.
    pub backoff: bool,

    /// Lower bound for `retry_time`.
    pub min_delay: Duration,

    /// Upper bound for `retry_time`.
    pub max_delay: Duration,

    initial_retry_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), true)
    }
}

impl RetryPolicy {
    /// Create a policy with the default delay bounds.
    pub fn new(max_retries: u32, retry_time: Duration, backoff: bool) -> Self {
        Self {
            total_retries: 0,
            max_retries,
            retry_time,
            backoff,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            initial_retry_time: retry_time,
        }
    }

    /// Replace the delay bounds. A ceiling below the floor is raised to it.
    #[must_use]
    pub fn with_bounds(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    /// Returns true once no retries remain.
    pub fn is_exhausted(&self) -> bool {
        self.total_retries >= self.max_retries
    }

    /// Delay that the next retry would wait, clamped to the bounds.
    pub fn current_delay(&self) -> Duration {
        self.clamp(self.retry_time)
    }

    /// Spend one retry.
    ///
    /// Returns the delay to wait before retrying, or `None` when the policy is
    /// exhausted. With backoff enabled the delay doubles on every call.
    pub fn advance(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let next = if self.backoff {
            self.retry_time.saturating_mul(2)
        } else {
            self.retry_time
        };
        self.retry_time = self.clamp(next);
        self.total_retries += 1;

        Some(self.retry_time)
    }

    /// Forget spent retries and restore the initial delay.
    pub fn reset(&mut self) {
        self.total_retries = 0;
        self.retry_time = self.initial_retry_time;
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.min_delay, self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or `policy` is spent.
///
/// `op` is invoked once up front and at most `max_retries - total_retries`
/// more times. The policy is mutated in place so callers can inspect how many
/// retries were used.
pub async fn run_policy<T, E, F, Fut>(
    policy: &mut RetryPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(RetryError::Permanent(err));
        }

        let Some(delay) = policy.advance() else {
            return Err(RetryError::Exhausted {
                retries: policy.total_retries,
                last: err,
            });
        };

        debug!(
            error = %err,
            retry = policy.total_retries,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}
