use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, StorageError};
use crate::pool::ConnectionProvider;

use super::{Connection, StatusHandle};

/// A [`Connection`] behind an async mutex, for callers that share one handle instead of
/// using a [`Pool`](crate::Pool).
///
/// [`status`](Self::status) reads the close/analyze bookkeeping without waiting for the
/// connection lock, so it works while another task holds the connection.
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<Connection>>,
    status: StatusHandle,
}

impl Connection {
    /// Wrap this connection for shared, serialized use.
    #[must_use]
    pub fn into_shared(self) -> SharedConnection {
        let status = self.status();
        SharedConnection {
            inner: Arc::new(Mutex::new(self)),
            status,
        }
    }
}

impl SharedConnection {
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().await
    }

    /// Lock from synchronous code. Panics when called from within an async context, like
    /// [`tokio::sync::Mutex::blocking_lock`].
    pub fn blocking_lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.blocking_lock()
    }

    #[must_use]
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Run `func` against the connection on the blocking thread pool.
    ///
    /// # Errors
    /// Returns `func`'s error, or `StorageError::Execution` if the blocking task panicked.
    pub async fn run_blocking<F, R>(&self, func: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            func(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Execution(format!("sqlite spawn_blocking join error: {e}")))?
    }

    /// Close the underlying connection; later operations fail with `StorageError::Closed`.
    ///
    /// # Errors
    /// Returns the engine error if SQLite refuses to close the handle.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.run_blocking(Connection::close).await
    }
}

#[async_trait]
impl ConnectionProvider for SharedConnection {
    async fn with_connection<R, F>(
        &self,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Cancelled.into()),
            guard = Arc::clone(&self.inner).lock_owned() => guard,
        };
        run_with_token(guard, cancel.clone(), work).await
    }
}

/// Run `work` on the blocking pool with `cancel` governing the connection's retry loops,
/// restoring the previous token afterwards.
pub(crate) async fn run_with_token<G, R, F>(
    mut guard: G,
    cancel: CancellationToken,
    work: F,
) -> Result<R, StorageError>
where
    G: std::ops::DerefMut<Target = Connection> + Send + 'static,
    F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let previous = guard.bind_cancellation(cancel);
        let out = work(&mut guard);
        guard.bind_cancellation(previous);
        out
    })
    .await
    .map_err(|e| StorageError::Execution(format!("sqlite spawn_blocking join error: {e}")))?
}

impl fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConnection")
            .field("status", &self.status.snapshot())
            .finish_non_exhaustive()
    }
}
