//! Async API Tests
//!
//! Many Tokio tasks share one `AsyncDispatcher`, each with its own session.

mod common;

use sqlitemulti::{AsyncDispatcher, Batch, Error, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_get_their_own_replies() {
    let (_dir, path) = common::temp_database("async_tasks.db");
    let db = AsyncDispatcher::connect(common::config(&path, 2)).await.unwrap();

    let mut tasks = Vec::new();
    for t in 0..16_i64 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            let mut session = db.attach();
            for round in 0..10_i64 {
                let tag = t * 100 + round;
                let row = session.fetch_one("SELECT ?", (tag,)).await.unwrap();
                assert_eq!(row, Some(vec![Value::Integer(tag)]));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(db.status().dispatched(), 160);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn async_batches_and_commit() {
    let (_dir, path) = common::temp_database("async_batch.db");
    let db = AsyncDispatcher::connect(common::config(&path, 1)).await.unwrap();
    let mut session = db.attach();

    session.execute("CREATE TABLE T (a TEXT)", (), true).await.unwrap();
    let batch = Batch::new()
        .push("INSERT INTO T VALUES (?)", ("a",))
        .push("INSERT INTO T VALUES (?)", ("b",));
    assert_eq!(session.insert_batch(batch).await.unwrap(), Some(2));

    session.execute("DELETE FROM T WHERE a = 'a'", (), false).await.unwrap();
    session.commit().await.unwrap();

    let rows = session.fetch_all("SELECT a FROM T", ()).await.unwrap();
    assert_eq!(rows, vec![vec![common::text("b")]]);

    assert!(session.detach());
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn async_shutdown_rejects_later_calls() {
    let (_dir, path) = common::temp_database("async_stop.db");
    let db = AsyncDispatcher::connect(common::config(&path, 1)).await.unwrap();
    let mut session = db.attach();

    db.shutdown().await.unwrap();
    let err = session.fetch_one("SELECT 1", ()).await.unwrap_err();
    assert!(matches!(err, Error::Misuse(_)));
}
