//! # Error Handling for sqlitemulti
//!
//! A single error enum ([`Error`]) covers every failure a caller can observe,
//! whether it happened in the dispatcher, in a worker thread, or inside a
//! worker process on the other side of a pipe.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Startup | `Connection`, `Config` | Fix configuration, do not retry blindly |
//! | Statement | `Statement` | Inspect the SQL / parameters |
//! | Protocol | `Protocol` | Bug in the caller or a version mismatch with the worker binary |
//! | Misuse | `Misuse` | Bug in the embedding application |
//! | Transport | `Disconnected`, `Io`, `Codec`, `WorkerPanicked` | Log and investigate |
//!
//! A batch that rolls back is *not* an error: it is reported as a failed
//! outcome (see [`crate::types::Outcome`]).

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in sqlitemulti operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Startup Errors (fatal for the worker that hit them)
    // =========================================================================

    /// A worker could not open its database connection.
    ///
    /// # When This Happens
    ///
    /// - The path points into a directory that does not exist
    /// - The file is not a SQLite database
    /// - `uri = true` but the target is not a valid `file:` URI
    ///
    /// The worker never enters its run loop; the error is returned from
    /// [`Dispatcher::connect`](crate::Dispatcher::connect).
    #[error("cannot open database '{database}': {message}")]
    Connection {
        /// The configured connection target
        database: String,
        /// Engine message
        message: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Statement Errors
    // =========================================================================

    /// A single statement failed inside the worker.
    ///
    /// The worker loop keeps running; only the caller that submitted the
    /// statement sees this error.
    #[error("statement failed: {0}")]
    Statement(String),

    // =========================================================================
    // Protocol and Misuse
    // =========================================================================

    /// Malformed command: mismatched batch arity or an unreadable wire frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The API was used out of order, e.g. `join()` without `stop()`.
    #[error("misuse: {0}")]
    Misuse(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================

    /// A queue or result channel was closed underneath a caller.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A worker thread panicked before it could be joined.
    #[error("worker '{0}' panicked")]
    WorkerPanicked(String),

    /// I/O on a worker process pipe failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
