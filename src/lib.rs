//! Retry- and cancellation-aware access to SQLite.
//!
//! Every operation on a [`Connection`], [`Statement`], or [`BackupSession`] treats lock
//! contention (`SQLITE_BUSY`, `SQLITE_LOCKED`, lock I/O errors) as transient: SQLite's
//! busy callback absorbs short waits inside one engine call, and a [`Retrier`] repeats
//! the whole logical operation when contention outlasts it. A
//! [`CancellationToken`](tokio_util::sync::CancellationToken) stops both layers promptly
//! and surfaces [`StorageError::Cancelled`] instead of a lock error.
//!
//! ```rust,no_run
//! use resilient_sqlite::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), StorageError> {
//! let options = ConnectionOptions::builder("app.db")
//!     .retry(RetryPolicy::new(5, std::time::Duration::from_millis(50)))
//!     .finish();
//! let conn = Connection::open(options, CancellationToken::new())?;
//! conn.multi_exec_with_transaction(&[
//!     Query::new("CREATE TABLE IF NOT EXISTS hits (path TEXT PRIMARY KEY, n INTEGER)"),
//!     Query::new("INSERT INTO hits VALUES (?, 1) ON CONFLICT(path) DO UPDATE SET n = n + 1")
//!         .arg("/index"),
//! ])?;
//! # Ok(())
//! # }
//! ```

pub mod certcache;
pub mod config;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod retry;
pub mod sqlite;
pub mod types;

pub use certcache::{CertCache, CertificateStore};
pub use config::{
    Attachment, BackupConfig, ConnectionOptions, ConnectionOptionsBuilder, PoolConfig,
    RetryConfig, StorageConfig,
};
pub use error::{Cancelled, StorageError};
pub use pool::{ConnectionManager, ConnectionProvider, Pool};
pub use retry::{Retrier, RetryAttempt, RetryPolicy, sleep_cancellable};
pub use sqlite::{
    BackupDriver, BackupReport, BackupSession, BackupStep, Connection, ConnectionStatus, Cursor,
    ForeignKeyViolation, Row, SharedConnection, Statement, StatusHandle, TxBehavior,
};
pub use types::{Query, SqlValue};
