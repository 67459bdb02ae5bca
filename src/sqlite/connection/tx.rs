use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::retry::sleep_cancellable;
use crate::types::Query;

use super::Connection;

const ROLLBACK_BUSY_RETRIES: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
];

/// Locking mode used by `BEGIN`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxBehavior {
    /// Take locks lazily on first read/write.
    #[default]
    Deferred,
    /// Take the write lock at `BEGIN`.
    Immediate,
    /// Take the write lock and keep readers out (outside WAL mode).
    Exclusive,
}

impl TxBehavior {
    fn begin_sql(self) -> &'static str {
        match self {
            TxBehavior::Deferred => "BEGIN DEFERRED",
            TxBehavior::Immediate => "BEGIN IMMEDIATE",
            TxBehavior::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

impl Connection {
    /// Run `body` inside a deferred transaction.
    ///
    /// See [`with_transaction_behavior`](Self::with_transaction_behavior).
    ///
    /// # Errors
    /// Returns the body's error after rolling back, or the begin/commit error.
    pub fn with_transaction<T, F>(&self, body: F) -> Result<T, StorageError>
    where
        F: FnMut(&Connection) -> Result<T, StorageError>,
    {
        self.with_transaction_behavior(TxBehavior::Deferred, body)
    }

    /// Begin a transaction, run `body`, and commit; any failure rolls back.
    ///
    /// Begin, body and commit form one retried unit: when lock contention aborts any part
    /// of it the transaction is rolled back and `body` runs again from the start, so it
    /// must not have side effects outside the database. A failed commit is rolled back
    /// too, which keeps the all-or-nothing guarantee.
    ///
    /// # Errors
    /// Returns `StorageError::Execution` if a transaction is already open on this
    /// connection, `StorageError::Fatal` if rolling back fails (the connection state is
    /// then unknown), or the error that aborted the transaction.
    pub fn with_transaction_behavior<T, F>(
        &self,
        behavior: TxBehavior,
        mut body: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut(&Connection) -> Result<T, StorageError>,
    {
        if self.in_transaction() {
            return Err(StorageError::Execution(
                "SQLite transaction already in progress".into(),
            ));
        }
        self.retry("transaction", || {
            tracing::debug!(conn = self.id, path = %self.path, ?behavior, "beginning transaction");
            self.raw()?.execute_batch(behavior.begin_sql())?;

            let value = match body(self) {
                Ok(value) => value,
                Err(err) => return Err(self.abort_transaction(err)),
            };
            if let Err(err) = self.raw()?.execute_batch("COMMIT") {
                return Err(self.abort_transaction(err.into()));
            }
            tracing::debug!(conn = self.id, path = %self.path, "committed transaction");
            Ok(value)
        })
    }

    /// Apply `queries` in order inside one transaction: either all of them take effect
    /// or none do.
    ///
    /// # Errors
    /// Returns the error of the first failing query, after rolling back.
    pub fn multi_exec_with_transaction(&self, queries: &[Query]) -> Result<(), StorageError> {
        self.with_transaction(|conn| conn.multi_exec(queries))
    }

    /// Roll back after `cause`, returning the error the caller should see.
    fn abort_transaction(&self, cause: StorageError) -> StorageError {
        tracing::debug!(conn = self.id, path = %self.path, error = %cause, "rolling back transaction");
        match self.rollback_with_busy_retries() {
            Ok(()) => cause,
            Err(rollback) => {
                tracing::error!(
                    conn = self.id,
                    path = %self.path,
                    error = %cause,
                    rollback_error = %rollback,
                    "rollback failed"
                );
                StorageError::Fatal(format!("rollback failed ({rollback}) after: {cause}"))
            }
        }
    }

    fn rollback_with_busy_retries(&self) -> Result<(), StorageError> {
        end_transaction_with_busy_retries(self.raw()?, "ROLLBACK", &self.cancel)
    }
}

/// Run `sql` (`COMMIT` or `ROLLBACK`) until the open transaction is gone, retrying lock
/// contention a few times. A cancelled token shortens the sleeps but never skips an
/// attempt: the transaction must not be left open.
pub(crate) fn end_transaction_with_busy_retries(
    raw: &rusqlite::Connection,
    sql: &str,
    cancel: &CancellationToken,
) -> Result<(), StorageError> {
    for (idx, delay) in ROLLBACK_BUSY_RETRIES.iter().copied().enumerate() {
        // Some errors (SQLITE_FULL, SQLITE_IOERR, ...) end the transaction on their own.
        if raw.is_autocommit() {
            return Ok(());
        }
        let err = match raw.execute_batch(sql) {
            Ok(()) => return Ok(()),
            Err(err) => StorageError::from(err),
        };
        if err.is_lock_contention() && idx + 1 < ROLLBACK_BUSY_RETRIES.len() {
            sleep_cancellable(cancel, delay);
            continue;
        }
        return Err(err);
    }
    Err(StorageError::Execution(format!("{sql} retries exhausted")))
}
