use std::time::Duration;

use resilient_sqlite::{
    Attachment, Connection, ConnectionOptions, Query, RetryPolicy, SqlValue, StorageError,
};
use tokio_util::sync::CancellationToken;

fn options(dir: &tempfile::TempDir, name: &str) -> ConnectionOptions {
    ConnectionOptions::builder(dir.path().join(name).to_string_lossy())
        .retry(RetryPolicy::new(3, Duration::from_millis(2)))
        .finish()
}

#[test]
fn closed_connection_fails_fast() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let mut conn = Connection::open(options(&dir, "closed.db"), CancellationToken::new())?;
    let status = conn.status();
    conn.close()?;
    conn.close()?;

    assert!(conn.is_closed());
    assert!(status.is_closed());
    for err in [
        conn.exec(&Query::new("SELECT 1")).unwrap_err(),
        conn.exec_batch("SELECT 1").unwrap_err(),
        conn.prepare(&Query::new("SELECT 1")).unwrap_err(),
        conn.analyze().unwrap_err(),
        conn.with_transaction(|_| Ok(())).unwrap_err(),
    ] {
        assert!(matches!(err, StorageError::Closed("connection")), "got {err}");
    }
    Ok(())
}

#[test]
fn closed_wins_over_cancelled() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let mut conn = Connection::open(options(&dir, "closed.db"), CancellationToken::new())?;
    conn.close()?;
    conn.cancellation().cancel();

    for err in [
        conn.exec(&Query::new("SELECT 1")).unwrap_err(),
        conn.select(&Query::new("SELECT 1"), |_| Ok(())).unwrap_err(),
        conn.multi_exec(&[Query::new("SELECT 1")]).unwrap_err(),
        conn.with_transaction(|_| Ok(())).unwrap_err(),
    ] {
        assert!(matches!(err, StorageError::Closed("connection")), "got {err}");
    }
    Ok(())
}

#[test]
fn foreign_keys_are_enforced_and_not_retried() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let conn = Connection::open(options(&dir, "fk.db"), CancellationToken::new())?;
    conn.exec_batch(
        "CREATE TABLE owners (id INTEGER PRIMARY KEY);
         CREATE TABLE pets (id INTEGER PRIMARY KEY, owner INTEGER NOT NULL REFERENCES owners(id));",
    )?;
    let err = conn
        .exec(&Query::new("INSERT INTO pets (owner) VALUES (?)").arg(1))
        .unwrap_err();
    assert!(err.is_foreign_key_violation());
    assert!(!err.is_lock_contention());
    assert!(conn.foreign_key_check()?.is_empty());
    Ok(())
}

#[test]
fn foreign_keys_can_be_disabled() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let opts = ConnectionOptions::builder(dir.path().join("nofk.db").to_string_lossy())
        .foreign_keys(false)
        .finish();
    let conn = Connection::open(opts, CancellationToken::new())?;
    let enforced = conn.select_one(&Query::new("PRAGMA foreign_keys"), |row| row.int64(0))?;
    assert_eq!(enforced, Some(Some(0)));
    conn.exec_batch(
        "CREATE TABLE owners (id INTEGER PRIMARY KEY);
         CREATE TABLE pets (id INTEGER PRIMARY KEY, owner INTEGER REFERENCES owners(id));",
    )?;
    conn.exec(&Query::new("INSERT INTO pets (owner) VALUES (?)").arg(1))?;
    assert_eq!(conn.foreign_key_check()?.len(), 1);
    Ok(())
}

#[test]
fn multi_exec_stops_at_first_failure() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let conn = Connection::open(options(&dir, "multi.db"), CancellationToken::new())?;
    conn.exec_batch("CREATE TABLE log (n INTEGER UNIQUE)")?;

    let batch = [
        Query::new("INSERT INTO log VALUES (1)"),
        Query::new("INSERT INTO log VALUES (2)"),
        Query::new("INSERT INTO log VALUES (2)"),
        Query::new("INSERT INTO log VALUES (3)"),
    ];
    let err = conn.multi_exec(&batch).unwrap_err();
    assert!(err.is_constraint_violation());

    let mut seen = Vec::new();
    conn.select(&Query::new("SELECT n FROM log ORDER BY n"), |row| {
        seen.push(row.int64(0)?.unwrap_or_default());
        Ok(())
    })?;
    assert_eq!(seen, [1, 2]);
    Ok(())
}

#[test]
fn attached_databases_are_reachable_by_schema() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let secrets = dir.path().join("secrets.db");
    let opts = ConnectionOptions::builder(dir.path().join("main.db").to_string_lossy())
        .attach(Attachment::new("secrets", secrets.to_string_lossy())?)
        .finish();
    let conn = Connection::open(opts, CancellationToken::new())?;
    conn.exec_batch("CREATE TABLE secrets.tokens (name TEXT PRIMARY KEY, token BLOB)")?;
    conn.exec(
        &Query::new("INSERT INTO secrets.tokens VALUES (?, ?)")
            .arg("api")
            .arg(vec![1_u8, 2, 3]),
    )?;
    let token = conn.select_one(
        &Query::new("SELECT token FROM secrets.tokens WHERE name = ?").arg("api"),
        |row| row.value(0),
    )?;
    assert_eq!(token, Some(SqlValue::Blob(vec![1, 2, 3])));
    assert!(secrets.exists());
    Ok(())
}

#[test]
fn analyze_on_close_records_statistics() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let opts = ConnectionOptions::builder(dir.path().join("stats.db").to_string_lossy())
        .analyze_on_close(true)
        .finish();
    let mut conn = Connection::open(opts, CancellationToken::new())?;
    conn.exec_batch("CREATE TABLE t (x INTEGER); CREATE INDEX t_x ON t (x);")?;
    let status = conn.status();
    assert!(status.last_analyze().is_none());
    conn.close()?;
    assert!(status.last_analyze().is_some());
    assert!(status.is_closed());
    Ok(())
}

#[test]
fn invalid_options_are_rejected_before_opening() {
    let err = Connection::open(ConnectionOptions::new(""), CancellationToken::new()).unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));

    let bad = ConnectionOptions::builder("x.db")
        .retry(RetryPolicy::new(-7, Duration::ZERO))
        .finish();
    assert!(matches!(
        Connection::open(bad, CancellationToken::new()),
        Err(StorageError::Config(_))
    ));
    assert!(Attachment::new("main", "other.db").is_err());
}

#[test]
fn json_arguments_bind_like_native_ones() -> Result<(), StorageError> {
    let dir = tempfile::tempdir()?;
    let conn = Connection::open(options(&dir, "json.db"), CancellationToken::new())?;
    conn.exec_batch("CREATE TABLE t (a, b, c, d)")?;
    let args = serde_json::json!(["text", 7, 2.5, null]);
    let args = args.as_array().cloned().unwrap_or_default();
    conn.exec(&Query::from_json_args("INSERT INTO t VALUES (?, ?, ?, ?)", &args)?)?;

    let row = conn.select_one(&Query::new("SELECT a, b, c, d FROM t"), |row| {
        Ok((row.text(0)?, row.int64(1)?, row.double(2)?, row.value(3)?))
    })?;
    assert_eq!(
        row,
        Some((Some("text".to_string()), Some(7), Some(2.5), SqlValue::Null))
    );

    let nested = [serde_json::json!({"a": 1})];
    assert!(matches!(
        Query::from_json_args("SELECT ?", &nested),
        Err(StorageError::Parameter(_))
    ));
    Ok(())
}
