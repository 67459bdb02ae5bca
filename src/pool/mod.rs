// Pool module - serialized access to retry-aware connections
//
// - manager: bb8 ConnectionManager
// - Pool: checkout with cancellation, closures run on the blocking pool
// - ConnectionProvider: the "borrow a connection, run this, give it back" capability

mod manager;

pub use manager::ConnectionManager;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionOptions, StorageConfig};
use crate::error::{Cancelled, StorageError};
use crate::sqlite::Connection;
use crate::sqlite::connection::run_with_token;

/// Borrow a connection, run `work` against it, and give it back.
///
/// This is all consumers such as [`CertCache`](crate::CertCache) know about storage.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Run `work` with exclusive use of a connection whose retry loops observe `cancel`.
    /// The connection is released whether `work` succeeds, fails, or the caller gives up.
    ///
    /// # Errors
    /// Returns `StorageError::Cancelled` if `cancel` fires before a connection is
    /// available, or `work`'s error.
    async fn with_connection<R, F>(
        &self,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static;
}

/// A bb8 pool of [`Connection`]s. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct Pool {
    inner: bb8::Pool<ConnectionManager>,
}

impl Pool {
    /// Build a pool. Connections are opened on demand, up to `max_size`.
    ///
    /// `shutdown` is observed by pooled connections between calls (validation on
    /// checkout, for example); each [`with_connection`](ConnectionProvider::with_connection)
    /// call binds its own token instead.
    ///
    /// # Errors
    /// Returns `StorageError::Config` for invalid options or a zero `max_size`.
    pub async fn new(
        options: ConnectionOptions,
        max_size: u32,
        shutdown: CancellationToken,
    ) -> Result<Self, StorageError> {
        options.validate()?;
        if max_size == 0 {
            return Err(StorageError::Config("pool size must be positive".into()));
        }
        tracing::debug!(path = %options.path, max_size, "building sqlite pool");
        let inner = bb8::Pool::builder()
            .max_size(max_size)
            .build(ConnectionManager::new(options, shutdown))
            .await?;
        Ok(Self { inner })
    }

    /// # Errors
    /// Same as [`Pool::new`].
    pub async fn from_config(
        config: &StorageConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        Self::new(config.into_connection_options()?, config.pool.max_size, shutdown).await
    }

    /// Connections currently open and idle.
    #[must_use]
    pub fn state(&self) -> (u32, u32) {
        let state = self.inner.state();
        (state.connections, state.idle_connections)
    }
}

#[async_trait]
impl ConnectionProvider for Pool {
    async fn with_connection<R, F>(
        &self,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Cancelled.into()),
            conn = self.inner.get_owned() => conn?,
        };
        run_with_token(conn, cancel.clone(), work).await
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (connections, idle) = self.state();
        f.debug_struct("Pool")
            .field("connections", &connections)
            .field("idle", &idle)
            .finish()
    }
}
