//! TLS certificate storage for ACME clients.
//!
//! Certificates live in `<schema>.certs`, a key/value table in a separately attached
//! database (`secrets` by default) so key material stays out of the main file and its
//! backups. The cache never holds on to a connection between calls: every operation
//! borrows one from its [`ConnectionProvider`].

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::{StorageConfig, validate_schema_name};
use crate::error::StorageError;
use crate::pool::ConnectionProvider;
use crate::types::Query;

/// Narrow storage contract of an ACME certificate manager.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// The stored bytes, or `None` on a cache miss.
    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or overwrite `key`.
    async fn put(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError>;

    /// Remove `key`; a missing key is not an error.
    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<(), StorageError>;
}

pub struct CertCache<P> {
    provider: P,
    table: String,
    schema_ready: OnceCell<()>,
}

impl<P: ConnectionProvider> CertCache<P> {
    /// Cache stored in the `secrets` schema, which `provider`'s connections must attach.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            table: format!("{}.certs", StorageConfig::SECRETS_SCHEMA),
            schema_ready: OnceCell::new(),
        }
    }

    /// Cache stored in `schema` (`main` works too).
    ///
    /// # Errors
    /// Returns `StorageError::Config` if `schema` is not a plain identifier.
    pub fn with_schema(provider: P, schema: &str) -> Result<Self, StorageError> {
        validate_schema_name(schema)?;
        Ok(Self {
            provider,
            table: format!("{schema}.certs"),
            schema_ready: OnceCell::new(),
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    async fn ensure_schema(&self, cancel: &CancellationToken) -> Result<(), StorageError> {
        self.schema_ready
            .get_or_try_init(|| async {
                let create = Query::new(format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        key TEXT PRIMARY KEY,
                        value BLOB NOT NULL
                    ) WITHOUT ROWID",
                    self.table
                ));
                tracing::debug!(table = %self.table, "creating certificate table");
                self.provider
                    .with_connection(cancel, move |conn| conn.exec(&create))
                    .await
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<P: ConnectionProvider> CertificateStore for CertCache<P> {
    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_schema(cancel).await?;
        let query = Query::new(format!("SELECT value FROM {} WHERE key = ?", self.table)).arg(key);
        let cert = self
            .provider
            .with_connection(cancel, move |conn| conn.select_one(&query, |row| row.blob(0)))
            .await?
            .flatten();
        tracing::debug!(key, hit = cert.is_some(), "certificate cache lookup");
        Ok(cert)
    }

    async fn put(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        self.ensure_schema(cancel).await?;
        let query = Query::new(format!(
            "INSERT INTO {} (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            self.table
        ))
        .arg(key)
        .arg(value.to_vec());
        self.provider
            .with_connection(cancel, move |conn| conn.exec(&query))
            .await
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<(), StorageError> {
        self.ensure_schema(cancel).await?;
        let query = Query::new(format!("DELETE FROM {} WHERE key = ?", self.table)).arg(key);
        self.provider
            .with_connection(cancel, move |conn| conn.exec(&query))
            .await
    }
}

impl<P> std::fmt::Debug for CertCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCache")
            .field("table", &self.table)
            .field("schema_ready", &self.schema_ready.initialized())
            .finish_non_exhaustive()
    }
}
