use std::future::Future;

use bb8::ManageConnection;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionOptions;
use crate::error::StorageError;
use crate::sqlite::Connection;
use crate::types::Query;

/// bb8 manager that opens retry-aware [`Connection`]s.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    options: ConnectionOptions,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Connections opened by this manager observe `shutdown` whenever no caller token is
    /// bound to them.
    #[must_use]
    pub fn new(options: ConnectionOptions, shutdown: CancellationToken) -> Self {
        Self { options, shutdown }
    }

    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

impl ManageConnection for ConnectionManager {
    type Connection = Connection;
    type Error = StorageError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let options = self.options.clone();
        let shutdown = self.shutdown.clone();
        async move {
            tokio::task::spawn_blocking(move || Connection::open(options, shutdown))
                .await
                .map_err(|e| StorageError::Connection(format!("sqlite open join error: {e}")))?
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            conn.select_one(&Query::new("SELECT 1"), |row| row.int64(0))?;
            Ok(())
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed() || conn.in_transaction()
    }
}
