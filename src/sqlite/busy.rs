//! Engine-level busy callback.
//!
//! rusqlite only accepts a plain `fn(i32) -> bool` as busy handler, so the state the
//! callback needs (retry bound, sleep length, cancellation token) lives in a thread-local
//! scope. Each retried unit of work installs a fresh scope on the thread that drives the
//! engine and the guard restores whatever was there before when it drops, so nested
//! operations and independent connections never share counters.

use std::cell::{Cell, RefCell};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::retry::{RetryPolicy, sleep_cancellable};

thread_local! {
    static BUSY_SCOPE: RefCell<Option<BusyContext>> = const { RefCell::new(None) };
    static CONTENTION: Cell<u64> = const { Cell::new(0) };
}

#[derive(Debug, Clone)]
pub(crate) struct BusyContext {
    pub(crate) policy: RetryPolicy,
    pub(crate) timeout: Duration,
    pub(crate) cancel: CancellationToken,
}

/// Guard returned by [`BusyScope::enter`]; restores the previous scope on drop.
pub(crate) struct BusyScope {
    previous: Option<BusyContext>,
    previous_contention: u64,
}

impl BusyScope {
    pub(crate) fn enter(ctx: BusyContext) -> Self {
        let previous = BUSY_SCOPE.with(|scope| scope.borrow_mut().replace(ctx));
        let previous_contention = CONTENTION.with(|c| c.replace(0));
        Self {
            previous,
            previous_contention,
        }
    }

    /// True while a scope is installed on this thread.
    pub(crate) fn active() -> bool {
        BUSY_SCOPE.with(|scope| scope.borrow().is_some())
    }

    /// Busy-callback invocations seen since this scope was entered.
    pub(crate) fn contention(&self) -> u64 {
        CONTENTION.with(Cell::get)
    }
}

impl Drop for BusyScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BUSY_SCOPE.with(|scope| *scope.borrow_mut() = previous);
        let seen = CONTENTION.with(Cell::get);
        CONTENTION.with(|c| c.set(self.previous_contention + seen));
    }
}

/// Registered with `rusqlite::Connection::busy_handler`.
///
/// `count` is the number of times the engine already called us for the current lock.
/// Returns `true` to make the engine try again, `false` to surface `SQLITE_BUSY`.
pub(crate) fn busy_callback(count: i32) -> bool {
    let Some(ctx) = BUSY_SCOPE.with(|scope| scope.borrow().clone()) else {
        // Engine call outside of any retried unit: fail fast and let the caller decide.
        return false;
    };
    CONTENTION.with(|c| c.set(c.get() + 1));

    if !ctx.policy.is_unbounded() && count > ctx.policy.max_retries {
        tracing::warn!(
            count,
            max = ctx.policy.max_retries,
            "sqlite busy callback giving up"
        );
        return false;
    }
    tracing::debug!(count, timeout = ?ctx.timeout, "sqlite busy callback waiting");
    // A cancelled wait surfaces SQLITE_BUSY; the outer retrier turns it into `Cancelled`.
    sleep_cancellable(&ctx.cancel, ctx.timeout)
}
