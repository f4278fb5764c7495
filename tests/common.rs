#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use sqlitemulti::{Config, Dispatcher, Session, Value};

/// A scratch database path inside a fresh temp dir. Keep the dir alive for
/// as long as the database is in use.
pub fn temp_database(name: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name).to_string_lossy().into_owned();
    (dir, path)
}

pub fn config(database: &str, workers: usize) -> Config {
    Config {
        workers,
        ..Config::new(database)
    }
}

pub fn connect(database: &str, workers: usize) -> Dispatcher {
    Dispatcher::connect(config(database, workers)).expect("connect dispatcher")
}

/// Config for process-isolated workers running the bundled worker binary.
pub fn process_config(database: &str, workers: usize) -> Config {
    Config {
        own_process: true,
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_sqlitemulti-worker"))),
        ..config(database, workers)
    }
}

/// Creates `T(a TEXT)` and commits it.
pub fn create_t(session: &Session) {
    assert!(session
        .execute("CREATE TABLE T (a TEXT)", (), true)
        .expect("create table"));
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn count(session: &Session, table: &str) -> i64 {
    let row = session
        .fetch_one(format!("SELECT COUNT(*) FROM {table}"), ())
        .expect("count rows")
        .expect("count returns a row");
    match row[0] {
        Value::Integer(n) => n,
        ref other => panic!("unexpected count value {other:?}"),
    }
}

pub fn shutdown(dispatcher: &Dispatcher) {
    dispatcher.stop();
    dispatcher.join().expect("join workers");
}

/// Long enough for a short session TTL to pass on a loaded machine.
pub fn past_ttl(ttl_ms: u64) -> Duration {
    Duration::from_millis(ttl_ms * 3)
}
