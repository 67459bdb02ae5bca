use rusqlite::types::FromSql;

use crate::error::{Cancelled, StorageError};
use crate::sqlite::busy::BusyScope;
use crate::sqlite::connection::{RetryContext, bind_args};
use crate::types::SqlValue;

/// A compiled query bound to the [`Connection`](crate::Connection) that prepared it.
///
/// The borrow on the connection means a statement cannot outlive the connection or survive
/// its `close`; [`Statement::close`] consumes the statement, so it cannot be used afterwards
/// either. Not `Sync`: one caller at a time.
pub struct Statement<'conn> {
    stmt: rusqlite::CachedStatement<'conn>,
    ctx: RetryContext,
    sql: String,
}

impl<'conn> Statement<'conn> {
    pub(crate) fn new(stmt: rusqlite::CachedStatement<'conn>, ctx: RetryContext, sql: String) -> Self {
        Self { stmt, ctx, sql }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.stmt.column_count()
    }

    /// # Errors
    /// Returns an error if `idx` is out of range.
    pub fn column_name(&self, idx: usize) -> Result<&str, StorageError> {
        Ok(self.stmt.column_name(idx)?)
    }

    /// Start stepping through the rows produced by the currently bound arguments.
    pub fn query(&mut self) -> Cursor<'_> {
        Cursor {
            rows: self.stmt.raw_query(),
            ctx: &self.ctx,
        }
    }

    /// Step through every row, calling `on_row` for each one. Stops at the first error,
    /// whether it comes from the engine or from `on_row`.
    ///
    /// # Errors
    /// Returns the first step or callback error.
    pub fn scan<F>(&mut self, mut on_row: F) -> Result<(), StorageError>
    where
        F: FnMut(&Row<'_>) -> Result<(), StorageError>,
    {
        let mut cursor = self.query();
        while let Some(row) = cursor.step()? {
            on_row(&row)?;
        }
        Ok(())
    }

    /// Rebind `args` and run the statement again without recompiling it. Returns the
    /// number of changed rows.
    ///
    /// # Errors
    /// Returns the bind or execution error; lock contention is retried.
    pub fn exec_bound(&mut self, args: &[SqlValue]) -> Result<usize, StorageError> {
        let stmt = &mut self.stmt;
        self.ctx.run("exec bound", || {
            stmt.clear_bindings();
            bind_args(stmt, args)?;
            Ok(stmt.raw_execute()?)
        })
    }

    /// Reset every placeholder to NULL.
    ///
    /// # Errors
    /// Returns `StorageError::Cancelled` if the connection's token already fired.
    pub fn clear_bindings(&mut self) -> Result<(), StorageError> {
        let stmt = &mut self.stmt;
        self.ctx.run("clear bindings", || {
            stmt.clear_bindings();
            Ok(())
        })
    }

    /// Release the statement back to its connection's cache.
    ///
    /// # Errors
    /// Currently infallible; kept fallible so callers handle release failures uniformly.
    pub fn close(self) -> Result<(), StorageError> {
        tracing::debug!(conn = self.ctx.conn_id, sql = %self.sql, "closing sql statement");
        drop(self.stmt);
        Ok(())
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("conn", &self.ctx.conn_id)
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

/// Forward-only iterator over a statement's result rows.
///
/// Steps run under the engine's busy callback. A step that still fails ends the cursor
/// (SQLite resets the statement), so the retry happens one level up: [`Connection::select`]
/// and transactions restart the whole query.
///
/// [`Connection::select`]: crate::Connection::select
pub struct Cursor<'s> {
    rows: rusqlite::Rows<'s>,
    ctx: &'s RetryContext,
}

impl Cursor<'_> {
    /// Advance to the next row; `None` once the rows are exhausted.
    ///
    /// # Errors
    /// Returns `StorageError::Cancelled` if the token fired, or the engine error.
    pub fn step(&mut self) -> Result<Option<Row<'_>>, StorageError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let _scope = BusyScope::enter(self.ctx.busy_context());
        let ctx = self.ctx;
        Ok(self.rows.next()?.map(|inner| Row { inner, ctx }))
    }
}

/// The current row of a [`Cursor`].
///
/// Typed readers return `Ok(None)` for SQL `NULL`; a value of the wrong type is an error.
pub struct Row<'r> {
    inner: &'r rusqlite::Row<'r>,
    ctx: &'r RetryContext,
}

impl Row<'_> {
    fn read<T: FromSql>(&self, operation: &'static str, idx: usize) -> Result<Option<T>, StorageError> {
        self.ctx
            .run(operation, || Ok(self.inner.get::<_, Option<T>>(idx)?))
    }

    /// # Errors
    /// Returns an error for a non-text column or an index out of range.
    pub fn text(&self, idx: usize) -> Result<Option<String>, StorageError> {
        self.read("read text column", idx)
    }

    /// # Errors
    /// Returns an error for a non-integer column or a value outside `i32`.
    pub fn integer(&self, idx: usize) -> Result<Option<i32>, StorageError> {
        self.read("read integer column", idx)
    }

    /// # Errors
    /// Returns an error for a non-integer column.
    pub fn int64(&self, idx: usize) -> Result<Option<i64>, StorageError> {
        self.read("read int64 column", idx)
    }

    /// # Errors
    /// Returns an error for a non-numeric column.
    pub fn double(&self, idx: usize) -> Result<Option<f64>, StorageError> {
        self.read("read double column", idx)
    }

    /// # Errors
    /// Returns an error for a column that is neither blob nor text.
    pub fn blob(&self, idx: usize) -> Result<Option<Vec<u8>>, StorageError> {
        self.read("read blob column", idx)
    }

    /// The column as whatever type SQLite stored.
    ///
    /// # Errors
    /// Returns an error if `idx` is out of range.
    pub fn value(&self, idx: usize) -> Result<SqlValue, StorageError> {
        self.ctx.run("read column", || {
            Ok(SqlValue::from(self.inner.get_ref(idx)?))
        })
    }
}
