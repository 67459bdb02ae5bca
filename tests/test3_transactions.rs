use std::time::Duration;

use resilient_sqlite::{Connection, ConnectionOptions, Query, RetryPolicy, StorageError, TxBehavior};
use tokio_util::sync::CancellationToken;

fn open_pair() -> Result<(tempfile::TempDir, Connection, Connection), StorageError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tx.db");
    let opts = ConnectionOptions::builder(path.to_string_lossy())
        .retry(RetryPolicy::new(5, Duration::from_millis(5)))
        .finish();
    let writer = Connection::open(opts.clone(), CancellationToken::new())?;
    writer.exec(&Query::new("PRAGMA journal_mode = WAL"))?;
    writer.exec_batch("CREATE TABLE accounts (name TEXT PRIMARY KEY, balance INTEGER NOT NULL CHECK (balance >= 0))")?;
    writer.multi_exec(&[
        Query::new("INSERT INTO accounts VALUES ('alice', 100)"),
        Query::new("INSERT INTO accounts VALUES ('bob', 0)"),
    ])?;
    let reader = Connection::open(opts, CancellationToken::new())?;
    Ok((dir, writer, reader))
}

fn balances(conn: &Connection) -> Result<Vec<(String, i64)>, StorageError> {
    let mut out = Vec::new();
    conn.select(
        &Query::new("SELECT name, balance FROM accounts ORDER BY name"),
        |row| {
            out.push((
                row.text(0)?.unwrap_or_default(),
                row.int64(1)?.unwrap_or_default(),
            ));
            Ok(())
        },
    )?;
    Ok(out)
}

fn transfer(conn: &Connection, amount: i64) -> Result<(), StorageError> {
    conn.with_transaction(|conn| {
        conn.exec(&Query::new("UPDATE accounts SET balance = balance + ? WHERE name = 'bob'").arg(amount))?;
        conn.exec(&Query::new("UPDATE accounts SET balance = balance - ? WHERE name = 'alice'").arg(amount))
    })
}

#[test]
fn failed_body_leaves_no_trace_on_any_connection() -> Result<(), StorageError> {
    let (_dir, writer, reader) = open_pair()?;

    // The credit succeeds, the debit violates the CHECK constraint: nothing may stick.
    let err = transfer(&writer, 150).unwrap_err();
    assert!(err.is_constraint_violation());
    let expected = vec![("alice".to_string(), 100), ("bob".to_string(), 0)];
    assert_eq!(balances(&writer)?, expected);
    assert_eq!(balances(&reader)?, expected);

    transfer(&writer, 40)?;
    let expected = vec![("alice".to_string(), 60), ("bob".to_string(), 40)];
    assert_eq!(balances(&reader)?, expected);
    Ok(())
}

#[test]
fn uncommitted_effects_are_invisible_to_other_connections() -> Result<(), StorageError> {
    let (_dir, writer, reader) = open_pair()?;
    writer.with_transaction_behavior(TxBehavior::Immediate, |conn| {
        conn.exec(&Query::new("UPDATE accounts SET balance = 1 WHERE name = 'bob'"))?;
        assert_eq!(balances(&reader)?[1].1, 0);
        Ok(())
    })?;
    assert_eq!(balances(&reader)?[1].1, 1);
    Ok(())
}

#[test]
fn multi_exec_with_transaction_applies_all_or_nothing() -> Result<(), StorageError> {
    let (_dir, writer, reader) = open_pair()?;
    let batch = [
        Query::new("INSERT INTO accounts VALUES ('carol', 5)"),
        Query::new("INSERT INTO accounts VALUES ('dave', -5)"),
    ];
    assert!(writer.multi_exec_with_transaction(&batch).is_err());
    assert_eq!(balances(&reader)?.len(), 2);

    writer.multi_exec_with_transaction(&batch[..1])?;
    assert_eq!(balances(&reader)?.len(), 3);
    Ok(())
}

#[test]
fn injected_contention_retries_the_whole_transaction() -> Result<(), StorageError> {
    let (_dir, writer, reader) = open_pair()?;
    let mut runs = 0;
    writer.inject_lock_faults_for_tests(2);
    writer.with_transaction(|conn| {
        runs += 1;
        conn.exec(&Query::new("UPDATE accounts SET balance = balance + 1 WHERE name = 'bob'"))
    })?;
    // Faults hit the transaction unit before BEGIN, so the body runs once and commits once.
    assert_eq!(runs, 1);
    assert_eq!(balances(&reader)?[1].1, 1);
    assert!(!writer.in_transaction());
    Ok(())
}

#[test]
fn cancelled_body_rolls_back() -> Result<(), StorageError> {
    let (_dir, writer, reader) = open_pair()?;
    let err = writer
        .with_transaction(|conn| {
            conn.exec(&Query::new("DELETE FROM accounts"))?;
            Err::<(), _>(StorageError::Cancelled)
        })
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(balances(&reader)?.len(), 2);
    assert!(!writer.in_transaction());
    Ok(())
}
