//! Dispatcher Semantics Tests
//!
//! Tests the caller-visible behaviour of session operations:
//! - Insert/fetch round trip on a single worker
//! - Commit durability across workers
//! - Batch atomicity (all applied or all rolled back), including when the
//!   batch's own commit is refused
//! - FIFO ordering on one worker
//! - Round-robin distribution across workers
//! - Failed statements answer the caller and leave the worker running

mod common;

use sqlitemulti::{Batch, Error, Params, Value};

use common::text;

#[test]
fn insert_then_fetch_on_single_worker() {
    let (_dir, path) = common::temp_database("scenario.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();

    common::create_t(&session);
    assert!(session.insert("INSERT INTO T (a) VALUES (?)", ("x",)).unwrap());

    let row = session.fetch_one("SELECT a FROM T", ()).unwrap();
    assert_eq!(row, Some(vec![text("x")]));

    common::shutdown(&dispatcher);
}

#[test]
fn committed_write_is_visible_on_another_worker() {
    let (_dir, path) = common::temp_database("durable.db");
    let dispatcher = common::connect(&path, 2);
    let session = dispatcher.attach();

    // worker 0
    common::create_t(&session);
    // worker 1, committed
    assert!(session.insert("INSERT INTO T VALUES (?)", ("durable",)).unwrap());
    // worker 0 reads what worker 1 committed
    let rows = session.fetch_all("SELECT a FROM T", ()).unwrap();
    assert_eq!(rows, vec![vec![text("durable")]]);

    common::shutdown(&dispatcher);
}

#[test]
fn uncommitted_write_becomes_visible_after_commit() {
    let (_dir, path) = common::temp_database("visibility.db");
    let dispatcher = common::connect(&path, 2);
    let session = dispatcher.attach();

    // worker 0
    common::create_t(&session);
    // worker 1, transaction left open
    assert!(session.execute("INSERT INTO T VALUES ('later')", (), false).unwrap());
    // worker 0 does not see it yet
    assert!(session.fetch_all("SELECT a FROM T", ()).unwrap().is_empty());
    // worker 1 commits
    session.commit().unwrap();
    // worker 0 now sees it
    assert_eq!(
        session.fetch_all("SELECT a FROM T", ()).unwrap(),
        vec![vec![text("later")]]
    );

    common::shutdown(&dispatcher);
}

#[test]
fn failing_batch_rolls_back_every_step() {
    let (_dir, path) = common::temp_database("batch_fail.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();
    common::create_t(&session);

    let batch = Batch::new()
        .push("INSERT INTO T VALUES (?)", ("one",))
        .push("INSERT INTO T VALUES (?)", ("two",))
        .push("INSERT INTO no_such_table VALUES (?)", ("three",));

    assert_eq!(session.insert_batch(batch).unwrap(), None);
    assert_eq!(common::count(&session, "T"), 0);

    // The worker is still healthy afterwards.
    assert!(session.insert("INSERT INTO T VALUES ('after')", ()).unwrap());
    assert_eq!(common::count(&session, "T"), 1);

    common::shutdown(&dispatcher);
}

#[test]
fn complete_batch_reports_statement_count() {
    let (_dir, path) = common::temp_database("batch_ok.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();
    common::create_t(&session);

    let batch = Batch::zip(
        vec![
            "INSERT INTO T VALUES (?)".to_string(),
            "INSERT INTO T VALUES (?)".to_string(),
            "UPDATE T SET a = upper(a) WHERE a = ?".to_string(),
        ],
        vec![
            Params::from(("a",)),
            Params::from(("b",)),
            Params::from(("a",)),
        ],
    )
    .unwrap();

    assert_eq!(session.execute_batch(batch).unwrap(), Some(3));
    let rows = session.fetch_all("SELECT a FROM T ORDER BY rowid", ()).unwrap();
    assert_eq!(rows, vec![vec![text("A")], vec![text("b")]]);

    common::shutdown(&dispatcher);
}

#[test]
fn mismatched_batch_is_rejected_before_dispatch() {
    let err = Batch::zip(
        vec!["INSERT INTO T VALUES (?)".to_string()],
        vec![Params::from(("a",)), Params::from(("b",))],
    )
    .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn delete_batch_and_delete() {
    let (_dir, path) = common::temp_database("delete.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();
    common::create_t(&session);

    assert!(session
        .execute_many(
            "INSERT INTO T VALUES (?)",
            vec![("a",), ("b",), ("c",), ("d",)],
        )
        .unwrap());

    let batch = Batch::new()
        .push("DELETE FROM T WHERE a = ?", ("a",))
        .push("DELETE FROM T WHERE a = ?", ("b",));
    assert_eq!(session.delete_batch(batch).unwrap(), Some(2));

    assert!(session.delete("DELETE FROM T WHERE a = :a", Params::named([(":a", "c")])).unwrap());
    assert_eq!(session.fetch_all("SELECT a FROM T", ()).unwrap(), vec![vec![text("d")]]);

    common::shutdown(&dispatcher);
}

#[test]
fn single_worker_runs_commands_in_order() {
    let (_dir, path) = common::temp_database("fifo.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();
    session
        .execute("CREATE TABLE seq (n INTEGER)", (), true)
        .unwrap();

    for n in 0..50_i64 {
        session.execute("INSERT INTO seq VALUES (?)", (n,), false).unwrap();
    }
    session.commit().unwrap();

    let rows = session.fetch_all("SELECT n FROM seq ORDER BY rowid", ()).unwrap();
    let seen: Vec<Value> = rows.into_iter().map(|mut row| row.remove(0)).collect();
    let expected: Vec<Value> = (0..50_i64).map(Value::Integer).collect();
    assert_eq!(seen, expected);

    common::shutdown(&dispatcher);
}

#[test]
fn commands_are_spread_round_robin() {
    let (_dir, path) = common::temp_database("round_robin.db");
    let dispatcher = common::connect(&path, 3);
    let session = dispatcher.attach();

    for _ in 0..7 {
        session.fetch_one("SELECT 1", ()).unwrap();
    }

    let status = dispatcher.status();
    let dispatched: Vec<u64> = status.workers.iter().map(|w| w.dispatched).collect();
    assert_eq!(dispatched, vec![3, 2, 2]);
    assert_eq!(status.queued(), 0);

    common::shutdown(&dispatcher);
}

#[test]
fn failing_statement_returns_error_and_worker_survives() {
    let (_dir, path) = common::temp_database("failure.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();
    common::create_t(&session);

    match session.insert("INSERT INTO missing VALUES (1)", ()) {
        Err(Error::Statement(message)) => assert!(message.contains("missing")),
        other => panic!("expected a statement error, got {other:?}"),
    }
    match session.fetch_all("SELEKT nonsense", ()) {
        Err(Error::Statement(_)) => {}
        other => panic!("expected a statement error, got {other:?}"),
    }

    assert!(session.insert("INSERT INTO T VALUES ('ok')", ()).unwrap());
    assert_eq!(common::count(&session, "T"), 1);

    common::shutdown(&dispatcher);
}

#[test]
fn fetch_one_without_rows_is_none() {
    let (_dir, path) = common::temp_database("empty.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();
    common::create_t(&session);

    assert_eq!(session.fetch_one("SELECT a FROM T", ()).unwrap(), None);
    assert!(session.fetch_all("SELECT a FROM T", ()).unwrap().is_empty());

    common::shutdown(&dispatcher);
}

#[test]
fn values_keep_their_storage_class() {
    let (_dir, path) = common::temp_database("values.db");
    let dispatcher = common::connect(&path, 1);
    let session = dispatcher.attach();
    session
        .execute("CREATE TABLE v (i, r, t, b, n)", (), true)
        .unwrap();

    session
        .insert(
            "INSERT INTO v VALUES (?, ?, ?, ?, ?)",
            (7_i64, 2.5_f64, "seven", vec![0_u8, 1, 2], Value::Null),
        )
        .unwrap();

    let row = session.fetch_one("SELECT i, r, t, b, n FROM v", ()).unwrap();
    assert_eq!(
        row,
        Some(vec![
            Value::Integer(7),
            Value::Real(2.5),
            text("seven"),
            Value::Blob(vec![0, 1, 2]),
            Value::Null,
        ])
    );

    common::shutdown(&dispatcher);
}

#[test]
fn batch_blocked_at_commit_is_rolled_back() {
    let (_dir, path) = common::temp_database("batch_busy.db");
    let dispatcher = sqlitemulti::Dispatcher::connect(sqlitemulti::Config {
        busy_timeout_ms: 200,
        ..common::config(&path, 2)
    })
    .unwrap();
    let session = dispatcher.attach();

    // worker 0
    common::create_t(&session);
    // worker 1 opens a read transaction and keeps its SHARED lock
    assert!(session.execute("BEGIN", (), false).unwrap());
    session.fetch_one("SELECT 1", ()).unwrap();
    assert!(session.fetch_all("SELECT * FROM T", ()).unwrap().is_empty());

    // worker 0 cannot commit while worker 1 reads
    let batch = Batch::new()
        .push("INSERT INTO T VALUES (?)", ("a",))
        .push("INSERT INTO T VALUES (?)", ("b",));
    assert_eq!(session.insert_batch(batch).unwrap(), None);

    // worker 1 ends its read, then worker 0 commits whatever it still holds
    session.commit().unwrap();
    session.commit().unwrap();

    assert_eq!(common::count(&session, "T"), 0);

    common::shutdown(&dispatcher);
}
