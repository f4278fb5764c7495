//! # Engine Adapter
//!
//! The narrow slice of SQLite that a worker needs: open, execute, fetch,
//! commit, rollback. Everything here runs on the worker that owns the
//! connection; nothing in this module is shared between threads.
//!
//! ## Implicit Transactions
//!
//! Callers drive durability with a commit flag per command, so writes must
//! not be autocommitted behind their back. Unless the isolation level is
//! [`IsolationLevel::Autocommit`], the engine opens a transaction before the
//! first data-modifying statement (INSERT, UPDATE, DELETE, REPLACE) and keeps
//! it open until [`Engine::commit`] or [`Engine::rollback`]:
//!
//! ```text
//! INSERT ...   -> BEGIN DEFERRED; INSERT ...
//! INSERT ...   -> INSERT ...            (already in a transaction)
//! commit()     -> COMMIT
//! SELECT ...   -> SELECT ...            (reads never open a transaction)
//! ```

use std::path::Path;

use rusqlite::types::ToSql;
use rusqlite::{params_from_iter, Connection, OpenFlags};

use crate::config::{Config, IsolationLevel};
use crate::error::{Error, Result};
use crate::types::{Batch, Params, Row, Value};

/// Statement keywords that open an implicit transaction.
const DML_KEYWORDS: [&str; 4] = ["INSERT", "UPDATE", "DELETE", "REPLACE"];

/// A worker's exclusive database connection.
#[derive(Debug)]
pub struct Engine {
    conn: Connection,
    isolation: IsolationLevel,
}

impl Engine {
    /// Opens the configured database.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] if the file cannot be opened or configured.
    pub fn open(config: &Config) -> Result<Self> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if config.uri {
            flags |= OpenFlags::SQLITE_OPEN_URI;
        }

        let connection_error = |err: rusqlite::Error| Error::Connection {
            database: config.database.clone(),
            message: err.to_string(),
        };

        let conn = Connection::open_with_flags(Path::new(&config.database), flags)
            .map_err(connection_error)?;
        conn.busy_timeout(config.busy_timeout())
            .map_err(connection_error)?;

        Ok(Self {
            conn,
            isolation: config.isolation_level,
        })
    }

    /// Opens a private in-memory database (tests and scratch work).
    pub fn open_in_memory(isolation: IsolationLevel) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|err| Error::Connection {
            database: ":memory:".to_string(),
            message: err.to_string(),
        })?;
        Ok(Self { conn, isolation })
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Runs one statement. Any rows it yields are stepped through and dropped,
    /// so row-returning pragmas work here too.
    pub fn execute(&mut self, sql: &str, params: &Params) -> rusqlite::Result<()> {
        self.begin_implicit(sql)?;
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = query(&mut stmt, params)?;
        while rows.next()?.is_some() {}
        Ok(())
    }

    /// Runs one statement once per parameter set.
    pub fn execute_many(&mut self, sql: &str, params: &[Params]) -> rusqlite::Result<()> {
        self.begin_implicit(sql)?;
        let mut stmt = self.conn.prepare(sql)?;
        for set in params {
            let mut rows = query(&mut stmt, set)?;
            while rows.next()?.is_some() {}
        }
        Ok(())
    }

    /// Runs every step of `batch` inside one transaction and returns the
    /// number of steps applied.
    ///
    /// On error the transaction is left open; the caller decides whether to
    /// roll back.
    pub fn execute_batch(&mut self, batch: &Batch) -> rusqlite::Result<usize> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch(self.isolation.begin_statement())?;
        }
        for (sql, params) in batch.iter() {
            let mut stmt = self.conn.prepare(sql)?;
            let mut rows = query(&mut stmt, params)?;
            while rows.next()?.is_some() {}
        }
        Ok(batch.len())
    }

    /// Returns the first row produced by `sql`.
    pub fn fetch_one(&mut self, sql: &str, params: &Params) -> rusqlite::Result<Option<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = query(&mut stmt, params)?;
        match rows.next()? {
            Some(row) => Ok(Some(read_row(row, columns)?)),
            None => Ok(None),
        }
    }

    /// Returns every row produced by `sql`.
    pub fn fetch_all(&mut self, sql: &str, params: &Params) -> rusqlite::Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = query(&mut stmt, params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_row(row, columns)?);
        }
        Ok(out)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Commits the open transaction, if any.
    pub fn commit(&mut self) -> rusqlite::Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Rolls back the open transaction, if any.
    pub fn rollback(&mut self) -> rusqlite::Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn begin_implicit(&mut self, sql: &str) -> rusqlite::Result<()> {
        if self.isolation != IsolationLevel::Autocommit
            && self.conn.is_autocommit()
            && is_dml(sql)
        {
            self.conn.execute_batch(self.isolation.begin_statement())?;
        }
        Ok(())
    }
}

/// Binds `params` and starts stepping `stmt`.
fn query<'s>(
    stmt: &'s mut rusqlite::Statement<'_>,
    params: &Params,
) -> rusqlite::Result<rusqlite::Rows<'s>> {
    match params {
        Params::Positional(values) => stmt.query(params_from_iter(values.iter())),
        Params::Named(pairs) => {
            let named: Vec<(&str, &dyn ToSql)> = pairs
                .iter()
                .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                .collect();
            stmt.query(named.as_slice())
        }
    }
}

fn read_row(row: &rusqlite::Row<'_>, columns: usize) -> rusqlite::Result<Row> {
    (0..columns)
        .map(|i| row.get_ref(i).map(Value::from))
        .collect()
}

fn is_dml(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");
    DML_KEYWORDS
        .iter()
        .any(|dml| keyword.eq_ignore_ascii_case(dml))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        let mut engine = Engine::open_in_memory(IsolationLevel::Deferred).unwrap();
        engine
            .execute("CREATE TABLE t (a TEXT, b INTEGER)", &Params::none())
            .unwrap();
        engine
    }

    #[test]
    fn test_is_dml() {
        assert!(is_dml("INSERT INTO t VALUES (1)"));
        assert!(is_dml("  delete from t"));
        assert!(is_dml("Replace INTO t VALUES (1)"));
        assert!(!is_dml("SELECT * FROM t"));
        assert!(!is_dml("CREATE TABLE x (a)"));
        assert!(!is_dml("INSERTED"));
    }

    #[test]
    fn test_dml_opens_transaction_until_commit() {
        let mut engine = engine();
        assert!(!engine.in_transaction());

        engine
            .execute("INSERT INTO t VALUES (?, ?)", &Params::from(("x", 1)))
            .unwrap();
        assert!(engine.in_transaction());

        engine.commit().unwrap();
        assert!(!engine.in_transaction());
    }

    #[test]
    fn test_autocommit_never_opens_transaction() {
        let mut engine = Engine::open_in_memory(IsolationLevel::Autocommit).unwrap();
        engine.execute("CREATE TABLE t (a)", &Params::none()).unwrap();
        engine.execute("INSERT INTO t VALUES (1)", &Params::none()).unwrap();
        assert!(!engine.in_transaction());
    }

    #[test]
    fn test_rollback_discards_uncommitted_rows() {
        let mut engine = engine();
        engine
            .execute("INSERT INTO t VALUES ('gone', 0)", &Params::none())
            .unwrap();
        engine.rollback().unwrap();

        let rows = engine.fetch_all("SELECT * FROM t", &Params::none()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_fetch_one_and_all() {
        let mut engine = engine();
        engine
            .execute_many(
                "INSERT INTO t VALUES (?, ?)",
                &[
                    Params::from(("a", 1)),
                    Params::from(("b", 2)),
                    Params::from(("c", 3)),
                ],
            )
            .unwrap();

        let first = engine
            .fetch_one("SELECT a, b FROM t ORDER BY b", &Params::none())
            .unwrap();
        assert_eq!(first, Some(vec![Value::Text("a".into()), Value::Integer(1)]));

        let all = engine
            .fetch_all("SELECT a FROM t WHERE b >= ?", &Params::from((2,)))
            .unwrap();
        assert_eq!(all.len(), 2);

        let none = engine
            .fetch_one("SELECT a FROM t WHERE b > 99", &Params::none())
            .unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn test_named_parameters() {
        let mut engine = engine();
        engine
            .execute(
                "INSERT INTO t VALUES (:a, :b)",
                &Params::named([(":a", Value::from("n")), (":b", Value::from(7))]),
            )
            .unwrap();

        let row = engine
            .fetch_one("SELECT b FROM t WHERE a = :a", &Params::named([(":a", "n")]))
            .unwrap();
        assert_eq!(row, Some(vec![Value::Integer(7)]));
    }

    #[test]
    fn test_row_returning_pragma_executes() {
        let mut engine = engine();
        engine
            .execute("PRAGMA journal_mode = MEMORY", &Params::none())
            .unwrap();
    }

    #[test]
    fn test_batch_leaves_transaction_open_on_error() {
        let mut engine = engine();
        let batch = Batch::new()
            .push("INSERT INTO t VALUES ('a', 1)", ())
            .push("INSERT INTO missing VALUES (1)", ());

        assert!(engine.execute_batch(&batch).is_err());
        assert!(engine.in_transaction());

        engine.rollback().unwrap();
        let rows = engine.fetch_all("SELECT * FROM t", &Params::none()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_open_rejects_missing_directory() {
        let config = Config::new("/definitely/not/here/db.sqlite");
        let err = Engine::open(&config).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }
}
