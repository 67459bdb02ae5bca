use std::time::Duration;

use resilient_sqlite::{
    Attachment, BackupDriver, BackupStep, Connection, ConnectionOptions, Query, RetryPolicy,
    StorageError,
};
use tokio_util::sync::CancellationToken;

fn open(path: &std::path::Path) -> Result<Connection, StorageError> {
    let opts = ConnectionOptions::builder(path.to_string_lossy())
        .retry(RetryPolicy::new(5, Duration::from_millis(5)))
        .finish();
    Connection::open(opts, CancellationToken::new())
}

fn notes(conn: &Connection) -> Result<Vec<String>, StorageError> {
    let mut out = Vec::new();
    conn.select(&Query::new("SELECT body FROM notes ORDER BY id"), |row| {
        out.push(row.text(0)?.unwrap_or_default());
        Ok(())
    })?;
    Ok(out)
}

/// Writes committed after the session starts must not reach the destination.
#[test]
fn destination_matches_snapshot_at_initiation() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let src_path = dir.path().join("source.db");
    let dst_path = dir.path().join("copy.db");

    let source = open(&src_path)?;
    source.exec(&Query::new("PRAGMA journal_mode = WAL"))?;
    source.exec_batch(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, pad BLOB);
         WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 200)
         INSERT INTO notes (body, pad) SELECT 'note ' || i, randomblob(500) FROM n;",
    )?;
    let other_writer = open(&src_path)?;

    let mut dest = open(&dst_path)?;
    {
        let mut session = source.backup("main", &mut dest, "main")?;
        other_writer.exec(&Query::new("INSERT INTO notes (body) VALUES ('late')"))?;
        other_writer.exec(&Query::new("DELETE FROM notes WHERE id = 1"))?;

        let mut steps = 0;
        while let BackupStep::More { remaining, pagecount } = session.step(2)? {
            assert!(remaining <= pagecount);
            steps += 1;
        }
        assert!(steps > 0);
        session.close()?;
    }
    let mut source = source;
    source.close()?;
    dest.close()?;

    let copy = open(&dst_path)?;
    let copied = notes(&copy)?;
    assert_eq!(copied.len(), 200);
    assert_eq!(copied.first().map(String::as_str), Some("note 1"));
    assert!(!copied.iter().any(|body| body == "late"));

    let live = notes(&other_writer)?;
    assert_eq!(live.len(), 200);
    assert_eq!(live.last().map(String::as_str), Some("late"));
    Ok(())
}

#[test]
fn driver_copies_attached_schema() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let secrets = dir.path().join("secrets.db");
    let opts = ConnectionOptions::builder(dir.path().join("main.db").to_string_lossy())
        .attach(Attachment::new("secrets", secrets.to_string_lossy())?)
        .finish();
    let source = Connection::open(opts, CancellationToken::new())?;
    source.exec_batch(
        "CREATE TABLE secrets.notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
         INSERT INTO secrets.notes (body) VALUES ('hidden');",
    )?;

    let dest = dir.path().join("secrets-backup.db");
    let report = BackupDriver::new(1)?.backup_to_path(&source, "secrets", &dest)?;
    assert_eq!(report.source_schema, "secrets");
    assert!(report.pages >= 2);
    assert!(!source.in_transaction());

    let copy = open(&dest)?;
    assert_eq!(notes(&copy)?, ["hidden"]);
    Ok(())
}

#[test]
fn session_survives_early_abort() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let source = open(&dir.path().join("source.db"))?;
    source.exec_batch(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
         INSERT INTO notes (body) VALUES ('a');",
    )?;
    let mut dest = open(&dir.path().join("partial.db"))?;
    {
        let mut session = source.backup("main", &mut dest, "main")?;
        assert!(matches!(session.step(1)?, BackupStep::More { .. }));
        session.close()?;
        assert!(session.is_closed());
    }
    // The source snapshot is released, so the source accepts writes again.
    source.exec(&Query::new("INSERT INTO notes (body) VALUES ('b')"))?;
    assert!(!source.in_transaction());
    Ok(())
}

#[test]
fn close_after_cancellation_releases_the_source() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let src_path = dir.path().join("source.db");
    let source = open(&src_path)?;
    source.exec_batch(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, pad BLOB);
         WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 50)
         INSERT INTO notes (body, pad) SELECT 'note ' || i, randomblob(500) FROM n;",
    )?;
    let mut dest = open(&dir.path().join("partial.db"))?;
    {
        let mut session = source.backup("main", &mut dest, "main")?;
        assert!(source.in_transaction());
        assert!(matches!(session.step(1)?, BackupStep::More { .. }));

        source.cancellation().cancel();
        assert!(session.step(1).unwrap_err().is_cancelled());
        session.close()?;
        session.close()?;
    }
    assert!(!source.in_transaction());

    // Without the snapshot's shared lock, another connection can write right away.
    let writer = Connection::open(
        ConnectionOptions::builder(src_path.to_string_lossy())
            .retry(RetryPolicy::never())
            .finish(),
        CancellationToken::new(),
    )?;
    writer.exec(&Query::new("INSERT INTO notes (body) VALUES ('after')"))?;
    Ok(())
}

#[test]
fn invalid_page_budgets_are_rejected() -> Result<(), StorageError> {
    for pages in [0, -2, i32::MIN] {
        assert!(matches!(BackupDriver::new(pages), Err(StorageError::Config(_))));
    }
    BackupDriver::new(-1)?;
    BackupDriver::new(64)?;

    let dir = tempfile::tempdir()?;
    let source = open(&dir.path().join("source.db"))?;
    source.exec_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)")?;
    let mut dest = open(&dir.path().join("copy.db"))?;
    let mut session = source.backup("main", &mut dest, "main")?;
    assert!(matches!(session.step(0), Err(StorageError::Config(_))));
    assert!(matches!(session.run_to_completion(0), Err(StorageError::Config(_))));
    assert!(matches!(session.step(-5), Err(StorageError::Config(_))));
    assert_eq!(session.step(-1)?, BackupStep::Done);
    session.close()?;
    Ok(())
}
