use chrono::Utc;

use crate::error::StorageError;
use crate::types::Query;

use super::Connection;

/// One row of `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    /// Table holding the dangling reference.
    pub table: String,
    /// Rowid of the offending row; `None` for `WITHOUT ROWID` tables.
    pub row_id: Option<i64>,
    /// Table the reference points at.
    pub parent: String,
    pub fk_index: i64,
}

impl std::fmt::Display for ForeignKeyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.row_id {
            Some(row_id) => write!(
                f,
                "{} row {} references missing {} (constraint {})",
                self.table, row_id, self.parent, self.fk_index
            ),
            None => write!(
                f,
                "{} references missing {} (constraint {})",
                self.table, self.parent, self.fk_index
            ),
        }
    }
}

impl Connection {
    /// Refresh the query planner statistics and remember when it happened.
    ///
    /// # Errors
    /// Returns the engine error if `ANALYZE` fails.
    pub fn analyze(&self) -> Result<(), StorageError> {
        self.retry("analyze", || {
            tracing::debug!(conn = self.id, path = %self.path, "analyzing database");
            Ok(self.raw()?.execute_batch("ANALYZE")?)
        })?;
        self.status.record_analyze(Utc::now());
        Ok(())
    }

    /// Reclaim free pages (databases in incremental auto-vacuum mode) and let SQLite run
    /// whatever `PRAGMA optimize` deems worthwhile.
    ///
    /// # Errors
    /// Returns the engine error of the first pragma that fails.
    pub fn optimize(&self) -> Result<(), StorageError> {
        self.exec(&Query::new("PRAGMA incremental_vacuum"))?;
        self.exec(&Query::new("PRAGMA optimize"))
    }

    /// Run `PRAGMA quick_check`. An empty result means the database is fine.
    ///
    /// # Errors
    /// Returns the engine error if the check itself cannot run.
    pub fn quick_check(&self) -> Result<Vec<String>, StorageError> {
        let mut problems = Vec::new();
        self.select(&Query::new("PRAGMA quick_check"), |row| {
            if let Some(line) = row.text(0)? {
                if line != "ok" {
                    problems.push(line);
                }
            }
            Ok(())
        })
        .map(|()| problems)
    }

    /// Run `PRAGMA foreign_key_check` over every table.
    ///
    /// # Errors
    /// Returns the engine error if the check itself cannot run.
    pub fn foreign_key_check(&self) -> Result<Vec<ForeignKeyViolation>, StorageError> {
        let mut violations = Vec::new();
        self.select(&Query::new("PRAGMA foreign_key_check"), |row| {
            violations.push(ForeignKeyViolation {
                table: row.text(0)?.unwrap_or_default(),
                row_id: row.int64(1)?,
                parent: row.text(2)?.unwrap_or_default(),
                fk_index: row.int64(3)?.unwrap_or_default(),
            });
            Ok(())
        })
        .map(|()| violations)
    }

    /// Both checks, folded into one error.
    ///
    /// # Errors
    /// Returns `StorageError::Integrity` listing every problem found.
    pub fn ensure_integrity(&self) -> Result<(), StorageError> {
        let mut problems = self.quick_check()?;
        problems.extend(self.foreign_key_check()?.iter().map(ToString::to_string));
        if problems.is_empty() {
            return Ok(());
        }
        tracing::error!(conn = self.id, path = %self.path, problems = problems.len(), "integrity check failed");
        Err(StorageError::Integrity(problems.join("; ")))
    }

    /// Toggle `PRAGMA read_uncommitted` (only meaningful in shared-cache mode).
    ///
    /// # Errors
    /// Returns the engine error if the pragma fails.
    pub fn read_uncommitted(&self, enabled: bool) -> Result<(), StorageError> {
        let sql = if enabled {
            "PRAGMA read_uncommitted = 1"
        } else {
            "PRAGMA read_uncommitted = 0"
        };
        self.exec_batch(sql)
    }
}
