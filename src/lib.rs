//! # sqlitemulti - Serialized SQLite Access
//!
//! sqlitemulti lets many callers share one SQLite database safely. Callers
//! never touch a connection: every operation becomes a [`Command`] that is
//! queued to a dedicated worker, and the worker's reply is routed back to
//! the caller that sent it.
//!
//! - **One owner per connection**: each worker is the only code that ever
//!   uses its connection
//! - **Per-caller reply routing**: every session has its own result channel
//! - **Several workers**: commands are spread round-robin across them
//! - **Process isolation**: workers can run as child processes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Sessions (threads)  /  AsyncSessions (tasks)           │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ Command
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                             │
//! │                                                                 │
//! │  ┌───────────────┐  ┌───────────────┐  ┌─────────────────────┐  │
//! │  │  Round-robin  │  │   Registry    │  │     Lifecycle       │  │
//! │  │    cursor     │  │ (result chans)│  │   (stop / join)     │  │
//! │  └───────────────┘  └───────────────┘  └─────────────────────┘  │
//! └──────────┬──────────────────┬───────────────────┬───────────────┘
//!            │ queue 0          │ queue 1           │ queue N-1
//!            ▼                  ▼                   ▼
//!     ┌────────────┐     ┌────────────┐      ┌────────────┐
//!     │  Worker 0  │     │  Worker 1  │ ...  │ Worker N-1 │  thread or
//!     │ (Engine)   │     │ (Engine)   │      │ (Engine)   │  child process
//!     └─────┬──────┘     └─────┬──────┘      └─────┬──────┘
//!           └──────────────────┼───────────────────┘
//!                              ▼
//!                       ┌─────────────┐
//!                       │   SQLite    │
//!                       └─────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Serialized connections**: a connection is used by one worker, one
//!    command at a time
//! 2. **FIFO per worker**: commands on one queue run in enqueue order
//! 3. **No cross-delivery**: a reply only ever reaches the session that sent
//!    the command
//! 4. **No stranded callers**: a failed or dropped command still answers
//!    its caller
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum for all failure modes
//! - [`types`]: Commands, parameters, values, outcomes
//! - [`config`]: Configuration and its loading
//! - [`engine`]: The SQLite adapter a worker drives
//! - [`worker`]: The worker loop
//! - [`queue`]: Command queues and worker handles
//! - [`process`]: Workers in child processes
//! - [`registry`]: Per-session result channels with expiry
//! - [`dispatcher`]: The blocking caller-facing API
//! - [`api`]: Async API on top of the dispatcher

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for sqlitemulti operations.
pub mod error;

/// Commands, statement parameters, values and replies.
///
/// Everything in here is plain data: serde-serializable so it can cross the
/// pipe to a worker process.
pub mod types;

/// Configuration.
///
/// [`Config`](config::Config) can be built in code or layered from defaults,
/// a TOML file and `SQLITEMULTI_*` environment variables.
pub mod config;

/// The SQLite adapter owned by a worker.
pub mod engine;

/// The worker loop: drain a queue, run each command, publish the reply.
pub mod worker;

/// Producer side of worker queues, and handles for joining workers.
pub mod queue;

/// Process-isolated workers and the pipe protocol they speak.
pub mod process;

/// Session id -> result channel registry with expiry.
pub mod registry;

/// Blocking dispatcher and sessions.
///
/// The main entry point is [`Dispatcher`](dispatcher::Dispatcher).
pub mod dispatcher;

/// Async API for Tokio applications.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================
// Rust pattern: Re-export commonly used types at the crate root for convenience.
// Users can write `use sqlitemulti::Dispatcher` instead of
// `use sqlitemulti::dispatcher::Dispatcher`.

pub use api::{AsyncDispatcher, AsyncSession};
pub use config::{Config, IsolationLevel};
pub use dispatcher::{Dispatcher, Session, SessionStatus, Status, WorkerStatus};
pub use error::{Error, Result};

pub use types::{Batch, Command, Outcome, Params, Row, SessionId, Statement, Value, WriteKind};
