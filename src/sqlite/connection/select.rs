use crate::error::StorageError;
use crate::sqlite::statement::{Row, Statement};
use crate::types::Query;

use super::{Connection, bind_args};

impl Connection {
    /// Compile `query` and bind its arguments.
    ///
    /// Statements come from the connection's statement cache, so preparing the same text
    /// again is cheap. The returned [`Statement`] borrows the connection, which keeps it
    /// from outliving a `close`.
    ///
    /// # Errors
    /// Returns the compile or bind error (an argument count that does not match the
    /// placeholders is reported as `rusqlite::Error::InvalidParameterCount`).
    pub fn prepare(&self, query: &Query) -> Result<Statement<'_>, StorageError> {
        query.ensure_text()?;
        self.retry("prepare", move || {
            tracing::debug!(conn = self.id, sql = %query.text, "preparing sql statement");
            self.prepare_once(query)
        })
    }

    fn prepare_once(&self, query: &Query) -> Result<Statement<'_>, StorageError> {
        let mut stmt = self.raw()?.prepare_cached(&query.text)?;
        bind_args(&mut stmt, &query.args)?;
        Ok(Statement::new(stmt, self.retry_context(), query.text.clone()))
    }

    /// Run `query` and hand every result row to `on_row`.
    ///
    /// Prepare and scan form one retried unit. If lock contention outlasts the engine's
    /// busy callback mid-scan, the query restarts from its first row, so `on_row` can see a
    /// row more than once; collect into something you can reset if that matters.
    ///
    /// # Errors
    /// Returns the first error from the engine or from `on_row`, which stops the scan.
    pub fn select<F>(&self, query: &Query, mut on_row: F) -> Result<(), StorageError>
    where
        F: FnMut(&Row<'_>) -> Result<(), StorageError>,
    {
        query.ensure_text()?;
        self.retry("select", || {
            tracing::debug!(
                conn = self.id,
                path = %self.path,
                sql = %query.text,
                args = query.args.len(),
                "selecting rows"
            );
            let mut stmt = self.prepare_once(query)?;
            stmt.scan(&mut on_row)
        })
    }

    /// First row of `query` mapped through `map`, or `None` when there are no rows.
    ///
    /// # Errors
    /// Same as [`select`](Self::select).
    pub fn select_one<T, F>(&self, query: &Query, mut map: F) -> Result<Option<T>, StorageError>
    where
        F: FnMut(&Row<'_>) -> Result<T, StorageError>,
    {
        query.ensure_text()?;
        self.retry("select one", || {
            let mut stmt = self.prepare_once(query)?;
            let mut cursor = stmt.query();
            let mapped = match cursor.step()? {
                Some(row) => Some(map(&row)?),
                None => None,
            };
            Ok(mapped)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::config::ConnectionOptions;
    use crate::retry::RetryPolicy;
    use crate::types::SqlValue;

    use super::*;

    fn open(dir: &tempfile::TempDir) -> Connection {
        let path = dir.path().join("select.db");
        let opts = ConnectionOptions::builder(path.to_string_lossy())
            .retry(RetryPolicy::new(3, Duration::from_millis(1)))
            .finish();
        let conn = Connection::open(opts, CancellationToken::new()).expect("open");
        conn.exec_batch(
            "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, score REAL, avatar BLOB);
             INSERT INTO people (name, score, avatar) VALUES ('ann', 1.5, x'0102');
             INSERT INTO people (name, score, avatar) VALUES ('bob', NULL, NULL);",
        )
        .expect("seed");
        conn
    }

    #[test]
    fn select_visits_every_row_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir);
        let mut names = Vec::new();
        conn.select(&Query::new("SELECT name FROM people ORDER BY id"), |row| {
            names.push(row.text(0)?.unwrap_or_default());
            Ok(())
        })
        .expect("select");
        assert_eq!(names, ["ann", "bob"]);
    }

    #[test]
    fn callback_error_stops_the_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir);
        let mut seen = 0;
        let err = conn
            .select(&Query::new("SELECT id FROM people"), |_| {
                seen += 1;
                Err(StorageError::Execution("stop".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Execution(msg) if msg == "stop"));
        assert_eq!(seen, 1);
    }

    #[test]
    fn nulls_are_reported_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir);
        let row = conn
            .select_one(
                &Query::new("SELECT score, avatar, name FROM people WHERE name = ?").arg("bob"),
                |row| Ok((row.double(0)?, row.blob(1)?, row.value(2)?)),
            )
            .expect("select")
            .expect("row");
        assert_eq!(row, (None, None, SqlValue::Text("bob".into())));
    }

    #[test]
    fn select_one_on_empty_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir);
        let row = conn
            .select_one(&Query::new("SELECT id FROM people WHERE id = ?").arg(99), |row| {
                row.int64(0)
            })
            .expect("select");
        assert!(row.is_none());
    }

    #[test]
    fn prepare_reports_bad_sql_without_retrying() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir);
        let err = conn.prepare(&Query::new("SELEC nothing")).unwrap_err();
        assert!(!err.is_lock_contention());
        assert!(matches!(err, StorageError::Sqlite(_)));
    }
}
