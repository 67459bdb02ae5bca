//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and traits
//! to make it easier to get started with the library.

pub use crate::certcache::{CertCache, CertificateStore};
pub use crate::config::{ConnectionOptions, StorageConfig};
pub use crate::error::StorageError;
pub use crate::pool::{ConnectionProvider, Pool};
pub use crate::retry::RetryPolicy;
pub use crate::sqlite::{BackupDriver, BackupStep, Connection, Row, TxBehavior};
pub use crate::types::{Query, SqlValue};
