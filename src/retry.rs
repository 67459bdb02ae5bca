//! Bounded backoff retries that stop as soon as a cancellation token fires.
//!
//! Every retried operation in this crate goes through exactly one [`Retrier::run`] call.
//! The retrier only repeats errors accepted by the caller's classifier, never sleeps
//! past a cancellation, and reports cancellation with the dedicated error rather than
//! the last error it saw.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, StorageError};

/// Upper bound on how long a cancellable sleep goes without looking at its token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How many times a failing unit of work is repeated, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `-1` retries until success or cancellation.
    pub max_retries: i32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const UNBOUNDED: i32 = -1;

    #[must_use]
    pub fn new(max_retries: i32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    #[must_use]
    pub fn unbounded(backoff: Duration) -> Self {
        Self::new(Self::UNBOUNDED, backoff)
    }

    /// Fail immediately on the first error.
    #[must_use]
    pub fn never() -> Self {
        Self::new(0, Duration::ZERO)
    }

    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max_retries == Self::UNBOUNDED
    }

    /// True once `retries` repeats have been spent.
    #[must_use]
    pub fn exhausted(&self, retries: u32) -> bool {
        !self.is_unbounded() && i64::from(retries) >= i64::from(self.max_retries)
    }

    /// # Errors
    /// Returns `StorageError::Config` when `max_retries` is below the unbounded sentinel.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_retries < Self::UNBOUNDED {
            return Err(StorageError::Config(format!(
                "retry bound must be -1 (unbounded) or a non-negative count, got {}",
                self.max_retries
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100))
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "unbounded retries, backoff {:?}", self.backoff)
        } else {
            write!(f, "{} retries, backoff {:?}", self.max_retries, self.backoff)
        }
    }
}

/// What a retry hook is told before the retrier sleeps.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 1-based number of the retry about to happen.
    pub attempt: u32,
    pub policy: &'a RetryPolicy,
    pub error: &'a E,
}

type RetryHook<'a, E> = Box<dyn Fn(&RetryAttempt<'_, E>) + 'a>;

/// Executes a unit of work under a [`RetryPolicy`] and a cancellation token.
pub struct Retrier<'a, E> {
    policy: RetryPolicy,
    cancel: &'a CancellationToken,
    on_retry: Option<RetryHook<'a, E>>,
}

impl<'a, E> Retrier<'a, E>
where
    E: From<Cancelled>,
{
    #[must_use]
    pub fn new(policy: RetryPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            on_retry: None,
        }
    }

    /// Install a hook invoked once per retry, before the backoff sleep.
    #[must_use]
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryAttempt<'_, E>) + 'a,
    {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Run `work` until it succeeds, fails with an error `classify` rejects, runs out of
    /// retries, or the token is cancelled.
    ///
    /// # Errors
    /// Returns the first non-retryable error, the last retryable error once the policy is
    /// exhausted, or `E::from(Cancelled)` when the token fires before or between attempts.
    pub fn run<T, W, C>(&self, mut work: W, classify: C) -> Result<T, E>
    where
        W: FnMut() -> Result<T, E>,
        C: Fn(&E) -> bool,
    {
        let mut retries: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            let error = match work() {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !classify(&error) {
                return Err(error);
            }
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            if self.policy.exhausted(retries) {
                return Err(error);
            }
            retries += 1;
            if let Some(hook) = &self.on_retry {
                hook(&RetryAttempt {
                    attempt: retries,
                    policy: &self.policy,
                    error: &error,
                });
            }
            if !sleep_cancellable(self.cancel, self.policy.backoff) {
                return Err(Cancelled.into());
            }
        }
    }
}

/// Sleep for `duration` on the current thread, waking early if `cancel` fires.
///
/// Returns `false` when the sleep was cut short (or never started) because of cancellation.
pub fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
    }
}
