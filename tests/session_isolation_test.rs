//! Session Isolation Tests
//!
//! Many threads share one dispatcher. Each thread must only ever receive
//! the replies to its own commands, with one worker or several.

mod common;

use std::sync::Arc;
use std::thread;

use sqlitemulti::{SessionId, Value};

const THREADS: i64 = 8;
const ROUNDS: i64 = 40;

#[test]
fn concurrent_sessions_never_see_each_others_replies() {
    let (_dir, path) = common::temp_database("isolation.db");
    let dispatcher = Arc::new(common::connect(&path, 2));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                let session = dispatcher.attach();
                for round in 0..ROUNDS {
                    let tag = t * 1_000 + round;
                    let row = session.fetch_one("SELECT ?", (tag,)).unwrap();
                    assert_eq!(row, Some(vec![Value::Integer(tag)]));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let status = dispatcher.status();
    assert_eq!(status.dispatched(), (THREADS * ROUNDS) as u64);
    assert_eq!(status.queued(), 0);
    assert_eq!(status.sessions.len(), THREADS as usize);

    common::shutdown(&dispatcher);
}

#[test]
fn concurrent_writers_on_one_worker_lose_nothing() {
    let (_dir, path) = common::temp_database("writers.db");
    let dispatcher = Arc::new(common::connect(&path, 1));
    dispatcher
        .attach()
        .execute("CREATE TABLE w (thread INTEGER, n INTEGER)", (), true)
        .unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                let session = dispatcher.attach();
                for n in 0..ROUNDS {
                    assert!(session.insert("INSERT INTO w VALUES (?, ?)", (t, n)).unwrap());
                }
                // This thread's rows, in the order it wrote them.
                let rows = session
                    .fetch_all("SELECT n FROM w WHERE thread = ? ORDER BY rowid", (t,))
                    .unwrap();
                let seen: Vec<Value> = rows.into_iter().map(|mut row| row.remove(0)).collect();
                let expected: Vec<Value> = (0..ROUNDS).map(Value::Integer).collect();
                assert_eq!(seen, expected);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let session = dispatcher.attach();
    assert_eq!(common::count(&session, "w"), THREADS * ROUNDS);

    common::shutdown(&dispatcher);
}

#[test]
fn handles_sharing_an_id_share_one_channel() {
    let (_dir, path) = common::temp_database("shared_id.db");
    let dispatcher = Arc::new(common::connect(&path, 1));
    let id = SessionId::new(42);

    let handles: Vec<_> = (0..4_i64)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                let session = dispatcher.session(id);
                for round in 0..ROUNDS {
                    let tag = t * 1_000 + round;
                    let row = session.fetch_one("SELECT ?", (tag,)).unwrap();
                    assert_eq!(row, Some(vec![Value::Integer(tag)]));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let status = dispatcher.status();
    assert_eq!(status.sessions.len(), 1);
    assert_eq!(status.sessions[0].id, id);

    common::shutdown(&dispatcher);
}
