use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionOptions;
use crate::error::{Cancelled, StorageError};
use crate::retry::{Retrier, RetryPolicy};
use crate::sqlite::busy::{BusyContext, BusyScope, busy_callback};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Bookkeeping that can be read while the connection itself is checked out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub closed: bool,
    pub last_analyze: Option<DateTime<Utc>>,
}

/// Cloneable view on a connection's [`ConnectionStatus`], guarded by its own lock.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<Mutex<ConnectionStatus>>);

impl StatusHandle {
    fn lock(&self) -> MutexGuard<'_, ConnectionStatus> {
        // The status is plain data; a panic while holding the lock cannot leave it torn.
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionStatus {
        *self.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn last_analyze(&self) -> Option<DateTime<Utc>> {
        self.lock().last_analyze
    }

    /// Flip to closed; returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut status = self.lock();
        !std::mem::replace(&mut status.closed, true)
    }

    pub(crate) fn record_analyze(&self, at: DateTime<Utc>) {
        self.lock().last_analyze = Some(at);
    }
}

/// Everything a retried unit of work needs, detached from the connection so statements and
/// backup sessions can carry their own copy.
#[derive(Debug, Clone)]
pub(crate) struct RetryContext {
    pub(crate) policy: RetryPolicy,
    pub(crate) busy_timeout: Duration,
    pub(crate) cancel: CancellationToken,
    pub(crate) conn_id: u64,
    pub(crate) path: Arc<str>,
}

impl RetryContext {
    pub(crate) fn busy_context(&self) -> BusyContext {
        BusyContext {
            policy: self.policy,
            timeout: self.busy_timeout,
            cancel: self.cancel.clone(),
        }
    }

    /// Run `work` as one retried unit: lock contention is retried with backoff, everything
    /// else is returned as is, and cancellation stops the loop.
    ///
    /// Called from inside another retried unit on the same thread, `work` runs once and its
    /// error goes to the enclosing unit, which owns the retries.
    pub(crate) fn run<T, W>(&self, operation: &'static str, mut work: W) -> Result<T, StorageError>
    where
        W: FnMut() -> Result<T, StorageError>,
    {
        if BusyScope::active() {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            let _scope = BusyScope::enter(self.busy_context());
            return work();
        }
        Retrier::new(self.policy, &self.cancel)
            .on_retry(|attempt| {
                tracing::warn!(
                    conn = self.conn_id,
                    path = %self.path,
                    operation,
                    attempt = attempt.attempt,
                    max = attempt.policy.max_retries,
                    backoff = ?attempt.policy.backoff,
                    error = %attempt.error,
                    "sqlite lock contention, retrying"
                );
            })
            .run(
                || {
                    let scope = BusyScope::enter(self.busy_context());
                    let out = work();
                    if scope.contention() > 0 {
                        tracing::debug!(
                            conn = self.conn_id,
                            operation,
                            waits = scope.contention(),
                            ok = out.is_ok(),
                            "sqlite busy callback absorbed contention"
                        );
                    }
                    out
                },
                StorageError::is_lock_contention,
            )
    }
}

/// One exclusive handle to a SQLite database.
///
/// Every operation is retried on lock contention according to the connection's
/// [`RetryPolicy`] and stops early once its cancellation token fires. A connection is
/// `Send` but not `Sync`: share it through a pool or [`Connection::into_shared`].
pub struct Connection {
    pub(super) handle: Option<rusqlite::Connection>,
    pub(super) id: u64,
    pub(super) path: Arc<str>,
    pub(super) options: ConnectionOptions,
    pub(super) cancel: CancellationToken,
    pub(super) status: StatusHandle,
    injected_faults: AtomicU32,
}

impl Connection {
    /// Open `options.path`, register the busy callback, apply the foreign key setting, and
    /// attach the configured secondary databases, all as one retried unit.
    ///
    /// # Errors
    /// Returns `StorageError::Config` for invalid options, `StorageError::Cancelled` if the
    /// token fires, or the engine error that made the open fail.
    pub fn open(options: ConnectionOptions, cancel: CancellationToken) -> Result<Self, StorageError> {
        options.validate()?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let path: Arc<str> = Arc::from(options.path.as_str());
        let ctx = RetryContext {
            policy: options.retry,
            busy_timeout: options.busy_timeout,
            cancel: cancel.clone(),
            conn_id: id,
            path: Arc::clone(&path),
        };

        let handle = ctx.run("open", || {
            tracing::debug!(conn = id, path = %path, "opening sqlite connection");
            let raw = rusqlite::Connection::open_with_flags(&options.path, options.open_flags)?;
            raw.busy_handler(Some(busy_callback))?;
            // Sent either way: the bundled engine may default to enforcing.
            raw.pragma_update(None, "foreign_keys", options.foreign_keys)?;
            for attachment in &options.attachments {
                raw.execute(
                    &format!("ATTACH DATABASE ?1 AS {}", attachment.schema),
                    [attachment.path.as_str()],
                )?;
            }
            Ok(raw)
        })?;

        tracing::debug!(conn = id, path = %path, retry = %options.retry, "opened sqlite connection");
        Ok(Self {
            handle: Some(handle),
            id,
            path,
            options,
            cancel,
            status: StatusHandle::default(),
            injected_faults: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Handle on the close/analyze bookkeeping that stays readable from other threads.
    #[must_use]
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    #[must_use]
    pub fn last_analyze_time(&self) -> Option<DateTime<Utc>> {
        self.status.last_analyze()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Replace the token governing this connection's retry loops, returning the old one.
    pub fn bind_cancellation(&mut self, cancel: CancellationToken) -> CancellationToken {
        std::mem::replace(&mut self.cancel, cancel)
    }

    /// True while an explicit transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.handle.as_ref().is_some_and(|raw| !raw.is_autocommit())
    }

    /// Close the connection. Runs a best-effort `ANALYZE` first when `analyze_on_close` is
    /// set. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns the engine error if SQLite refuses to close the handle.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.handle.is_none() {
            return Ok(());
        }
        if self.options.analyze_on_close {
            if let Err(err) = self.analyze() {
                tracing::warn!(conn = self.id, path = %self.path, error = %err, "analyze before close failed");
            }
        }
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if !self.status.mark_closed() {
            return Ok(());
        }
        tracing::debug!(conn = self.id, path = %self.path, "closing sqlite connection");
        let result = handle.close().map_err(|(_, err)| StorageError::Sqlite(err));
        tracing::debug!(conn = self.id, path = %self.path, ok = result.is_ok(), "closed sqlite connection");
        result
    }

    pub(crate) fn raw(&self) -> Result<&rusqlite::Connection, StorageError> {
        self.handle.as_ref().ok_or(StorageError::Closed("connection"))
    }

    pub(crate) fn raw_mut(&mut self) -> Result<&mut rusqlite::Connection, StorageError> {
        self.handle.as_mut().ok_or(StorageError::Closed("connection"))
    }

    pub(crate) fn retry_context(&self) -> RetryContext {
        RetryContext {
            policy: self.options.retry,
            busy_timeout: self.options.busy_timeout,
            cancel: self.cancel.clone(),
            conn_id: self.id,
            path: Arc::clone(&self.path),
        }
    }

    /// Run `work` as one retried unit on this connection. A closed connection reports
    /// `Closed` even when its token has fired.
    pub(crate) fn retry<T, W>(&self, operation: &'static str, mut work: W) -> Result<T, StorageError>
    where
        W: FnMut() -> Result<T, StorageError>,
    {
        self.raw()?;
        self.retry_context().run(operation, || {
            self.take_injected_fault(operation)?;
            work()
        })
    }

    /// Make the next `count` retried units on this connection fail with `SQLITE_BUSY`
    /// before they reach the engine.
    #[doc(hidden)]
    pub fn inject_lock_faults_for_tests(&self, count: u32) {
        self.injected_faults.store(count, Ordering::SeqCst);
    }

    /// Injected faults not consumed yet.
    #[doc(hidden)]
    pub fn injected_lock_faults_remaining(&self) -> u32 {
        self.injected_faults.load(Ordering::SeqCst)
    }

    fn take_injected_fault(&self, operation: &str) -> Result<(), StorageError> {
        let taken = self
            .injected_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            return Err(StorageError::busy(operation));
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(conn = self.id, path = %self.path, error = %err, "error closing dropped sqlite connection");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .field("retry", &self.options.retry)
            .finish_non_exhaustive()
    }
}
