use crate::error::StorageError;
use crate::types::Query;

use super::{Connection, bind_args};

impl Connection {
    /// Prepare, bind, and run `query` to completion as a single retried unit. A lock error
    /// restarts the whole unit with a freshly prepared statement.
    ///
    /// Rows produced by the statement (for example by a `PRAGMA`) are stepped through and
    /// discarded.
    ///
    /// # Errors
    /// Returns `StorageError` if preparing, binding, or executing fails for a reason other
    /// than transient lock contention, or if retries run out.
    pub fn exec(&self, query: &Query) -> Result<(), StorageError> {
        query.ensure_text()?;
        self.retry("exec", || {
            tracing::debug!(
                conn = self.id,
                path = %self.path,
                sql = %query.text,
                args = query.args.len(),
                "executing sql statement"
            );
            self.exec_once(query)
        })
    }

    pub(super) fn exec_once(&self, query: &Query) -> Result<(), StorageError> {
        let mut stmt = self.raw()?.prepare_cached(&query.text)?;
        bind_args(&mut stmt, &query.args)?;
        let mut rows = stmt.raw_query();
        while rows.next()?.is_some() {}
        Ok(())
    }

    /// Run a batch of semicolon-separated statements without arguments.
    ///
    /// # Errors
    /// Returns `StorageError` if any statement fails.
    pub fn exec_batch(&self, sql: &str) -> Result<(), StorageError> {
        if sql.trim().is_empty() {
            return Err(StorageError::Parameter("query text is empty".into()));
        }
        self.retry("exec batch", || {
            tracing::debug!(conn = self.id, path = %self.path, sql, "executing sql batch");
            self.raw()?.execute_batch(sql).map_err(StorageError::from)
        })
    }

    /// Execute `queries` in order. The first non-retryable failure stops the batch: earlier
    /// queries stay applied, later ones are not attempted. No transaction is implied; see
    /// [`multi_exec_with_transaction`](Self::multi_exec_with_transaction).
    ///
    /// # Errors
    /// Returns the error of the first query that fails.
    pub fn multi_exec(&self, queries: &[Query]) -> Result<(), StorageError> {
        for query in queries {
            query.ensure_text()?;
        }
        self.retry("multi exec", || {
            tracing::debug!(
                conn = self.id,
                path = %self.path,
                queries = queries.len(),
                "executing multiple sql queries"
            );
            for query in queries {
                tracing::debug!(conn = self.id, sql = %query.text, args = query.args.len(), "executing sql statement");
                self.exec_once(query)?;
            }
            Ok(())
        })
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE on this connection.
    ///
    /// # Errors
    /// Returns `StorageError::Closed` after [`close`](Self::close).
    pub fn changes(&self) -> Result<u64, StorageError> {
        let changes = self.raw()?.changes();
        Ok(u64::try_from(changes).unwrap_or(u64::MAX))
    }
}
