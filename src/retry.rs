//! Bounded retry with exponential backoff and full jitter.
//!
//! `max_attempts` counts retries: an action that always fails transiently is
//! invoked `max_attempts + 1` times. Before retry `n` (1-based) the policy
//! sleeps for a delay drawn uniformly from `[0, min(max_delay, base_delay * 2^n))`.

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay (100 milliseconds).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default delay cap (10 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Terminal outcome of [`RetryPolicy::run`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancellation fired before an attempt or during a backoff delay.
    #[error("retry cancelled")]
    Cancelled,

    /// Every attempt failed with a transient error.
    #[error("retries exhausted after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    /// The action failed with a non-transient error.
    #[error("non-transient failure after {attempts} attempts: {error}")]
    Fatal { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Number of times the action was invoked.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { attempts, .. } | Self::Fatal { attempts, .. } => Some(*attempts),
        }
    }

    /// The last error returned by the action.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { error, .. } | Self::Fatal { error, .. } => Some(error),
        }
    }
}

/// Source of backoff delays.
///
/// Implementations return a value in `[0, upper)`; the default draws from
/// the thread-local RNG so concurrent retriers do not align.
pub trait JitterSource: Send + Sync {
    fn sample(&self, upper: Duration) -> Duration;
}

/// Uniform jitter from `rand::rng()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadJitter;

impl JitterSource for ThreadJitter {
    fn sample(&self, upper: Duration) -> Duration {
        let nanos = u64::try_from(upper.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::rng().random_range(0..nanos))
    }
}

/// Retry policy parameters plus the jitter source.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Arc<dyn JitterSource>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: Arc::new(ThreadJitter),
        }
    }

    /// Replace the jitter source (deterministic tests).
    #[must_use]
    pub fn with_jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(max_delay, base_delay * 2^attempt)`, saturating on overflow.
    pub fn backoff_window(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Full-jitter delay for `attempt`, always strictly below the window
    /// (zero when the window is zero).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let window = self.backoff_window(attempt);
        if window.is_zero() {
            return Duration::ZERO;
        }
        self.jitter
            .sample(window)
            .min(window - Duration::from_nanos(1))
    }

    /// Run `action` until it succeeds, fails non-transiently, exhausts the
    /// retry budget or `cancel` fires.
    ///
    /// `action` receives the 1-based invocation number. `on_retry` is called
    /// with the retry number and the triggering error before each delay; a
    /// panic inside it is logged and swallowed.
    pub async fn run<T, E, F, Fut, P, R>(
        &self,
        cancel: &CancellationToken,
        is_transient: P,
        mut on_retry: R,
        mut action: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        R: FnMut(u32, &E),
    {
        let mut retries: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let invocation = retries + 1;
            let error = match action(invocation).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_transient(&error) {
                return Err(RetryError::Fatal {
                    attempts: invocation,
                    error,
                });
            }
            if retries >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: invocation,
                    error,
                });
            }

            retries += 1;
            if catch_unwind(AssertUnwindSafe(|| on_retry(retries, &error))).is_err() {
                tracing::warn!(retry = retries, "Retry callback panicked");
            }

            let delay = self.delay_for(retries);
            tracing::debug!(retry = retries, delay = ?delay, "Backing off before retry");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
