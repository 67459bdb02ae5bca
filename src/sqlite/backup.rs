//! Online backups through SQLite's page-copying backup API.
//!
//! A [`BackupSession`] pins a read snapshot of the source when it is created, so the
//! destination ends up with the source's contents as of that instant even when other
//! connections keep writing while pages are copied. [`BackupDriver`] wraps the
//! step/close protocol for whole-file backups.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rusqlite::DatabaseName;
use rusqlite::backup::{Backup, StepResult};

use crate::config::BackupConfig;
use crate::config::{validate_page_budget, validate_schema_name};
use crate::error::StorageError;
use crate::sqlite::connection::{Connection, RetryContext, end_transaction_with_busy_retries};

/// Outcome of one [`BackupSession::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStep {
    /// Pages are left to copy.
    More { remaining: i32, pagecount: i32 },
    /// The destination holds a complete copy.
    Done,
}

fn database_name(schema: &str) -> Result<DatabaseName<'_>, StorageError> {
    Ok(match schema {
        "main" => DatabaseName::Main,
        "temp" => DatabaseName::Temp,
        other => {
            validate_schema_name(other)?;
            DatabaseName::Attached(other)
        }
    })
}

impl Connection {
    /// Start copying schema `source_schema` of this connection into `dest_schema` of
    /// `dest`.
    ///
    /// Starting a backup can hit the same transient locks as any other operation, so the
    /// initiation is retried. Unless this connection is already inside a transaction, the
    /// session also opens a read transaction on it that lasts until
    /// [`BackupSession::close`]: writes committed by other connections after this call
    /// are not copied.
    ///
    /// # Errors
    /// Returns `StorageError::Closed` if either connection is closed, or the engine error
    /// that kept the backup from starting.
    pub fn backup<'a, 'b>(
        &'a self,
        source_schema: &str,
        dest: &'b mut Connection,
        dest_schema: &str,
    ) -> Result<BackupSession<'a, 'b>, StorageError> {
        let from_name = database_name(source_schema)?;
        let to_name = database_name(dest_schema)?;
        let dest_path = dest.path().to_owned();
        let source = self.raw()?;
        let target = dest.raw_mut()?;

        tracing::debug!(
            conn = self.id(),
            source = %self.path(),
            source_schema,
            dest = %dest_path,
            dest_schema,
            "starting backup"
        );
        // Backup borrows both handles; a retry closure cannot hand it out, so probe with
        // a throwaway session and build the real one once the engine accepts it.
        self.retry("backup init", || {
            drop(Backup::new_with_names(source, from_name, &mut *target, to_name)?);
            Ok(())
        })?;

        let pinned = !self.in_transaction();
        if pinned {
            let probe = format!("SELECT 1 FROM {}.sqlite_master LIMIT 1", quote_schema(source_schema));
            self.retry("backup snapshot", || {
                source.execute_batch("BEGIN DEFERRED")?;
                // The first read is what actually takes the snapshot.
                match source.query_row(&probe, [], |_| Ok(())) {
                    Ok(()) | Err(rusqlite::Error::QueryReturnedNoRows) => Ok(()),
                    Err(err) => {
                        source.execute_batch("ROLLBACK")?;
                        Err(err.into())
                    }
                }
            })?;
        }

        let backup = match Backup::new_with_names(source, from_name, target, to_name) {
            Ok(backup) => backup,
            Err(err) => {
                if pinned {
                    source.execute_batch("ROLLBACK")?;
                }
                return Err(err.into());
            }
        };

        Ok(BackupSession {
            backup: Some(backup),
            source,
            pinned,
            ctx: self.retry_context(),
            source_schema: source_schema.to_owned(),
            dest_path,
        })
    }
}

fn quote_schema(schema: &str) -> String {
    format!("\"{}\"", schema.replace('"', "\"\""))
}

/// A backup in progress. Drive it with [`step`](Self::step) until [`BackupStep::Done`],
/// then [`close`](Self::close) it, also after an error or cancellation. A destination
/// whose session did not reach `Done` is incomplete and must not be trusted.
pub struct BackupSession<'a, 'b> {
    backup: Option<Backup<'a, 'b>>,
    source: &'a rusqlite::Connection,
    pinned: bool,
    ctx: RetryContext,
    source_schema: String,
    dest_path: String,
}

impl BackupSession<'_, '_> {
    /// Copy up to `pages` pages; `-1` copies everything left.
    ///
    /// # Errors
    /// Returns `StorageError::Config` for a budget of 0 or below -1, `StorageError::Closed`
    /// after [`close`](Self::close), `StorageError::Cancelled` if the token fired, or the
    /// engine error once retries run out.
    pub fn step(&mut self, pages: i32) -> Result<BackupStep, StorageError> {
        validate_page_budget(pages)?;
        let backup = self.backup.as_ref().ok_or(StorageError::Closed("backup session"))?;
        let step = self.ctx.run("backup step", || match backup.step(pages)? {
            StepResult::Done => Ok(BackupStep::Done),
            StepResult::More => {
                let progress = backup.progress();
                Ok(BackupStep::More {
                    remaining: progress.remaining,
                    pagecount: progress.pagecount,
                })
            }
            StepResult::Busy => Err(StorageError::busy("backup step")),
            StepResult::Locked => Err(StorageError::locked("backup step")),
            #[allow(unreachable_patterns)]
            other => Err(StorageError::Execution(format!(
                "unexpected backup step result {other:?}"
            ))),
        })?;
        tracing::debug!(
            conn = self.ctx.conn_id,
            source_schema = %self.source_schema,
            dest = %self.dest_path,
            ?step,
            "backup step"
        );
        Ok(step)
    }

    /// Step with a fixed page budget until the copy is complete. Returns the source's
    /// page count.
    ///
    /// # Errors
    /// Returns the first error from [`step`](Self::step).
    pub fn run_to_completion(&mut self, pages_per_step: i32) -> Result<i32, StorageError> {
        validate_page_budget(pages_per_step)?;
        loop {
            match self.step(pages_per_step)? {
                BackupStep::More { .. } => {}
                BackupStep::Done => return Ok(self.page_count()),
            }
        }
    }

    /// Pages in the source as of the last step.
    #[must_use]
    pub fn page_count(&self) -> i32 {
        self.backup.as_ref().map_or(0, |b| b.progress().pagecount)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.backup.is_none()
    }

    /// Release the backup and the source snapshot. Works after cancellation too; once it
    /// has succeeded, calling it again is a no-op.
    ///
    /// # Errors
    /// Returns the engine error if the source's read transaction cannot be ended. The
    /// session then still holds the snapshot and `close` can be called again.
    pub fn close(&mut self) -> Result<(), StorageError> {
        let released = self.backup.take().is_some();
        if self.pinned {
            end_transaction_with_busy_retries(self.source, "COMMIT", &self.ctx.cancel)?;
            self.pinned = false;
        }
        if released {
            tracing::debug!(conn = self.ctx.conn_id, dest = %self.dest_path, "closed backup session");
        }
        Ok(())
    }
}

impl Drop for BackupSession<'_, '_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(conn = self.ctx.conn_id, dest = %self.dest_path, error = %err, "error closing dropped backup session");
        }
    }
}

impl std::fmt::Debug for BackupSession<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupSession")
            .field("source_schema", &self.source_schema)
            .field("dest", &self.dest_path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// What a completed [`BackupDriver`] run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub source_schema: String,
    pub destination: PathBuf,
    pub pages: i32,
    pub elapsed: Duration,
}

/// Whole-file backups with cleanup on failure. One backup runs at a time per driver.
#[derive(Debug)]
pub struct BackupDriver {
    pages_per_step: i32,
    lock: Mutex<()>,
}

impl Default for BackupDriver {
    fn default() -> Self {
        Self {
            pages_per_step: -1,
            lock: Mutex::new(()),
        }
    }
}

impl BackupDriver {
    /// `pages_per_step` of `-1` copies the whole database in one step.
    ///
    /// # Errors
    /// Returns `StorageError::Config` for a budget of 0 or below -1.
    pub fn new(pages_per_step: i32) -> Result<Self, StorageError> {
        validate_page_budget(pages_per_step)?;
        Ok(Self {
            pages_per_step,
            ..Self::default()
        })
    }

    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn from_config(config: &BackupConfig) -> Result<Self, StorageError> {
        Self::new(config.pages_per_step)
    }

    /// Copy `source_schema` of `source` into a fresh database file at `dest`.
    ///
    /// The destination is opened with the source's options (minus attachments). If
    /// anything fails, cancellation included, the partial destination is removed.
    ///
    /// # Errors
    /// Returns the error that stopped the backup.
    pub fn backup_to_path(
        &self,
        source: &Connection,
        source_schema: &str,
        dest: impl AsRef<Path>,
    ) -> Result<BackupReport, StorageError> {
        let dest = dest.as_ref();
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();

        match self.copy(source, source_schema, dest) {
            Ok(pages) => {
                let report = BackupReport {
                    source_schema: source_schema.to_owned(),
                    destination: dest.to_path_buf(),
                    pages,
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    source = %source.path(),
                    source_schema,
                    dest = %dest.display(),
                    pages,
                    elapsed = ?report.elapsed,
                    "backup complete"
                );
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(
                    source = %source.path(),
                    source_schema,
                    dest = %dest.display(),
                    error = %err,
                    "backup failed, removing partial destination"
                );
                remove_partial(dest)?;
                Err(err)
            }
        }
    }

    /// Like [`backup_to_path`](Self::backup_to_path), but skip (returning `None`) when
    /// `dest` exists and was written less than `max_age` ago.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if `dest` cannot be inspected, or the backup error.
    pub fn backup_if_older(
        &self,
        source: &Connection,
        source_schema: &str,
        dest: impl AsRef<Path>,
        max_age: Duration,
    ) -> Result<Option<BackupReport>, StorageError> {
        let dest = dest.as_ref();
        match fs::metadata(dest) {
            Ok(meta) => {
                let age = meta.modified()?.elapsed().unwrap_or_default();
                if age < max_age {
                    tracing::debug!(dest = %dest.display(), ?age, ?max_age, "backup is recent enough, skipping");
                    return Ok(None);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.backup_to_path(source, source_schema, dest).map(Some)
    }

    fn copy(&self, source: &Connection, source_schema: &str, dest: &Path) -> Result<i32, StorageError> {
        let options = source.options().for_path(dest.to_string_lossy());
        let mut target = Connection::open(options, source.cancellation().clone())?;
        let pages = {
            let mut session = source.backup(source_schema, &mut target, "main")?;
            let copied = session.run_to_completion(self.pages_per_step);
            let closed = session.close();
            let pages = copied?;
            closed?;
            pages
        };
        target.close()?;
        Ok(pages)
    }
}

fn remove_partial(dest: &Path) -> Result<(), StorageError> {
    let mut sidecars = Vec::with_capacity(3);
    sidecars.push(dest.to_path_buf());
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut name = dest.as_os_str().to_owned();
        name.push(suffix);
        sidecars.push(PathBuf::from(name));
    }
    for path in sidecars {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
