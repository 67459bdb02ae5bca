use thiserror::Error;

use rusqlite::ErrorCode;
use rusqlite::ffi;

/// Marker error produced when a cancellation token fires during a retry loop or a sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL execution error: {0}")]
    Execution(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Fatal storage error: {0}")]
    Fatal(String),
}

impl From<Cancelled> for StorageError {
    fn from(_: Cancelled) -> Self {
        StorageError::Cancelled
    }
}

impl From<bb8::RunError<StorageError>> for StorageError {
    fn from(err: bb8::RunError<StorageError>) -> Self {
        match err {
            bb8::RunError::User(inner) => inner,
            bb8::RunError::TimedOut => {
                StorageError::Connection("SQLite pool checkout timed out".into())
            }
        }
    }
}

impl StorageError {
    /// True for transient lock contention: busy, locked (including shared-cache locks),
    /// and lock-related I/O errors. These are the only errors the retry layers repeat.
    #[must_use]
    pub fn is_lock_contention(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                    || err.extended_code == ffi::SQLITE_IOERR_LOCK
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY
        )
    }

    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
        )
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }

    /// Synthetic `SQLITE_BUSY`, used where the engine reports contention as a status
    /// instead of an error (backup steps) and by the test fault hooks.
    pub(crate) fn busy(context: &str) -> Self {
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ErrorCode::DatabaseBusy,
                extended_code: ffi::SQLITE_BUSY,
            },
            Some(format!("database is locked ({context})")),
        ))
    }

    pub(crate) fn locked(context: &str) -> Self {
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ErrorCode::DatabaseLocked,
                extended_code: ffi::SQLITE_LOCKED,
            },
            Some(format!("database table is locked ({context})")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(extended_code: i32) -> StorageError {
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(extended_code),
            None,
        ))
    }

    #[test]
    fn lock_contention_codes() {
        assert!(failure(ffi::SQLITE_BUSY).is_lock_contention());
        assert!(failure(ffi::SQLITE_BUSY_SNAPSHOT).is_lock_contention());
        assert!(failure(ffi::SQLITE_LOCKED_SHAREDCACHE).is_lock_contention());
        assert!(failure(ffi::SQLITE_IOERR_LOCK).is_lock_contention());
        assert!(StorageError::busy("test").is_lock_contention());
        assert!(StorageError::locked("test").is_lock_contention());
    }

    #[test]
    fn other_failures_are_not_contention() {
        assert!(!failure(ffi::SQLITE_CONSTRAINT_FOREIGNKEY).is_lock_contention());
        assert!(!failure(ffi::SQLITE_IOERR_WRITE).is_lock_contention());
        assert!(!failure(ffi::SQLITE_CORRUPT).is_lock_contention());
        assert!(!StorageError::Cancelled.is_lock_contention());
        assert!(!StorageError::Closed("connection").is_lock_contention());
    }

    #[test]
    fn constraint_classification() {
        let fk = failure(ffi::SQLITE_CONSTRAINT_FOREIGNKEY);
        assert!(fk.is_foreign_key_violation());
        assert!(fk.is_constraint_violation());

        let unique = failure(ffi::SQLITE_CONSTRAINT_UNIQUE);
        assert!(!unique.is_foreign_key_violation());
        assert!(unique.is_constraint_violation());
    }

    #[test]
    fn cancelled_marker_converts() {
        let err: StorageError = Cancelled.into();
        assert!(err.is_cancelled());
    }
}
