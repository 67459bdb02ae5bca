// SQLite module - retry-aware wrappers around rusqlite
//
// - busy: engine-level busy callback and its per-operation scope
// - connection: Connection and SharedConnection
// - statement: prepared statements, cursors and typed row readers
// - backup: online backup sessions and the backup-to-file driver

pub(crate) mod busy;
pub mod backup;
pub mod connection;
pub mod statement;

pub use backup::{BackupDriver, BackupReport, BackupSession, BackupStep};
pub use connection::{
    Connection, ConnectionStatus, ForeignKeyViolation, SharedConnection, StatusHandle, TxBehavior,
};
pub use statement::{Cursor, Row, Statement};
