//! # Domain Types for sqlitemulti
//!
//! This module defines the values that travel between callers and workers:
//! parameters and rows on the way in and out, the [`Command`] sum type that
//! describes one requested operation, and the [`Outcome`] / [`Failure`] pair
//! a worker publishes in reply.
//!
//! Everything here derives `Serialize`/`Deserialize` because the same types
//! cross the pipe to a worker process when process isolation is enabled.
//!
//! ## Design Philosophy: Commands That Can't Be Built Wrong
//!
//! Each command variant carries only what its operation needs. A transaction
//! is a [`Batch`] of `(sql, params)` pairs, so "N statements but M parameter
//! sets" can only happen at the single fallible constructor
//! [`Batch::zip`], which rejects it before anything is enqueued.

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Session Identification
// =============================================================================

/// Identity of a logical caller.
///
/// Every session owns one cached result channel in the dispatcher's registry.
/// Ids are issued by [`Dispatcher::attach`](crate::Dispatcher::attach) or
/// supplied by the caller through [`Dispatcher::session`](crate::Dispatcher::session).
///
/// # Rust Pattern: Newtype
///
/// Wrapping `u64` keeps session ids from being confused with request ids on
/// the worker pipe, which are also `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a session id from a raw value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// =============================================================================
// Values and Rows
// =============================================================================

/// One SQLite value, in any of the five storage classes.
///
/// JSON has no infinity or NaN, so on the wire a non-finite `Real` is the
/// string `"inf"`, `"-inf"` or `"nan"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(#[serde(with = "real")] f64),
    Text(String),
    Blob(Vec<u8>),
}

/// A result row: column values in select-list order.
pub type Row = Vec<Value>;

mod real {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Named(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("nan")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Named(name) => match name.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("not a real number: {other:?}"))),
            },
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b.as_slice())),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Bound parameters for one statement.
///
/// Positional parameters fill `?` / `?N` placeholders in order. Named
/// parameters carry their full placeholder, prefix included (`:id`, `@id`,
/// `$id`).
///
/// # Example
///
/// ```rust
/// use sqlitemulti::types::{Params, Value};
///
/// let positional: Params = ("alice", 42).into();
/// assert_eq!(positional.len(), 2);
///
/// let named = Params::named([(":name", Value::from("alice"))]);
/// assert!(!named.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Params {
    /// No parameters.
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }

    /// Builds named parameters from `(placeholder, value)` pairs.
    pub fn named<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Number of bound values.
    pub fn len(&self) -> usize {
        match self {
            Params::Positional(values) => values.len(),
            Params::Named(pairs) => pairs.len(),
        }
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::none()
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::none()
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Params {
    fn from(values: [T; N]) -> Self {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }
}

// Rust pattern: one macro arm per tuple arity, like rusqlite's own `Params`
// impls, so `("x",)` and `(1, "a", 2.5)` both convert without a `vec!`.
macro_rules! impl_params_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: Into<Value>),+> From<($($name,)+)> for Params {
            #[allow(non_snake_case)]
            fn from(($($name,)+): ($($name,)+)) -> Self {
                Params::Positional(vec![$($name.into()),+])
            }
        }
    };
}

impl_params_for_tuple!(A);
impl_params_for_tuple!(A, B);
impl_params_for_tuple!(A, B, C);
impl_params_for_tuple!(A, B, C, D);
impl_params_for_tuple!(A, B, C, D, E);
impl_params_for_tuple!(A, B, C, D, E, F);
impl_params_for_tuple!(A, B, C, D, E, F, G);
impl_params_for_tuple!(A, B, C, D, E, F, G, H);

// =============================================================================
// Statements and Batches
// =============================================================================

/// An ordered list of `(sql, params)` pairs executed as one transaction.
///
/// If any step fails the whole transaction is rolled back and the caller
/// gets a failed outcome instead of an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    steps: Vec<(String, Params)>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step (builder style).
    pub fn push(mut self, sql: impl Into<String>, params: impl Into<Params>) -> Self {
        self.steps.push((sql.into(), params.into()));
        self
    }

    /// Pairs a list of statements with a list of parameter sets.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] when the two lists differ in length. This happens
    /// on the calling thread, before any command is enqueued.
    pub fn zip(statements: Vec<String>, params: Vec<Params>) -> Result<Self> {
        if statements.len() != params.len() {
            return Err(Error::Protocol(format!(
                "{} statements but {} parameter sets",
                statements.len(),
                params.len()
            )));
        }
        Ok(Self {
            steps: statements.into_iter().zip(params).collect(),
        })
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when the batch has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Iterates over the steps in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Params)> {
        self.steps.iter().map(|(sql, params)| (sql.as_str(), params))
    }
}

/// The statement payload of a write command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// One statement with its parameters.
    Single { sql: String, params: Params },
    /// A transaction of several statements.
    Batch(Batch),
}

impl Statement {
    /// Creates a single-statement payload.
    pub fn single(sql: impl Into<String>, params: impl Into<Params>) -> Self {
        Statement::Single {
            sql: sql.into(),
            params: params.into(),
        }
    }
}

impl From<Batch> for Statement {
    fn from(batch: Batch) -> Self {
        Statement::Batch(batch)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Which write operation a statement command stands for.
///
/// The worker treats all three the same way; the kind only changes the
/// dispatcher's default commit flag and what shows up in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Execute,
    Insert,
    Delete,
}

/// One requested database operation.
///
/// # Lifecycle
///
/// Built once per call by the dispatcher, consumed exactly once by a worker,
/// then dropped. Never mutated after it is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// `EXECUTE`, `INSERT` or `DELETE`, single statement or batch.
    Write {
        kind: WriteKind,
        statement: Statement,
        commit: bool,
    },
    /// One statement run once per parameter set. Always commits.
    ExecuteMany { sql: String, params: Vec<Params> },
    /// Returns the first row, if any.
    FetchOne { sql: String, params: Params },
    /// Returns every row.
    FetchAll { sql: String, params: Params },
    /// Commits the worker's open transaction.
    Commit,
    /// Ends the worker loop. Queued commands behind it are not run.
    Stop,
}

impl Command {
    /// Short operation name for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Write {
                kind: WriteKind::Execute,
                ..
            } => "execute",
            Command::Write {
                kind: WriteKind::Insert,
                ..
            } => "insert",
            Command::Write {
                kind: WriteKind::Delete,
                ..
            } => "delete",
            Command::ExecuteMany { .. } => "execute_many",
            Command::FetchOne { .. } => "fetch_one",
            Command::FetchAll { .. } => "fetch_all",
            Command::Commit => "commit",
            Command::Stop => "stop",
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// What a worker reports back for a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Success marker. `Done(false)` means a batch was rolled back.
    Done(bool),
    /// A batch committed; carries the number of statements applied.
    Applied(usize),
    /// Result of `fetch_one`.
    Row(Option<Row>),
    /// Result of `fetch_all`.
    Rows(Vec<Row>),
}

impl Outcome {
    /// Extracts a success marker.
    pub fn into_done(self) -> Result<bool> {
        match self {
            Outcome::Done(done) => Ok(done),
            Outcome::Applied(_) => Ok(true),
            other => Err(unexpected("a success marker", &other)),
        }
    }

    /// Extracts a batch result: `Some(n)` committed, `None` rolled back.
    pub fn into_applied(self) -> Result<Option<usize>> {
        match self {
            Outcome::Applied(n) => Ok(Some(n)),
            Outcome::Done(false) => Ok(None),
            other => Err(unexpected("a batch result", &other)),
        }
    }

    /// Extracts a single optional row.
    pub fn into_row(self) -> Result<Option<Row>> {
        match self {
            Outcome::Row(row) => Ok(row),
            other => Err(unexpected("a row", &other)),
        }
    }

    /// Extracts a row set.
    pub fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            Outcome::Rows(rows) => Ok(rows),
            other => Err(unexpected("rows", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Outcome) -> Error {
    Error::Protocol(format!("expected {wanted} in reply, got {got:?}"))
}

/// Category of a failure reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Statement,
    Protocol,
    Disconnected,
}

/// A failed command, in a form that survives the trip across a pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Statement,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            message: message.into(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Disconnected,
            message: message.into(),
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::Statement => Error::Statement(failure.message),
            FailureKind::Protocol => Error::Protocol(failure.message),
            FailureKind::Disconnected => Error::Disconnected(failure.message),
        }
    }
}

/// A worker's answer to one command.
pub type Reply = std::result::Result<Outcome, Failure>;

// =============================================================================
// Tests
// =============================================================================
