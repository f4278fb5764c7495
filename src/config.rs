//! # Connection Configuration
//!
//! [`Config`] is everything [`Dispatcher::connect`](crate::Dispatcher::connect)
//! needs: the database target, the engine options every worker opens its
//! connection with, and the dispatcher's own knobs (worker count, isolation
//! mode, session TTL).
//!
//! ## Loading
//!
//! `Config` is plain serde data, so it can be built in code or layered with
//! figment:
//!
//! 1. Compiled defaults
//! 2. A TOML file or string
//! 3. `SQLITEMULTI_*` environment variables (e.g. `SQLITEMULTI_WORKERS=4`)
//!
//! ```rust
//! use sqlitemulti::Config;
//!
//! let config = Config::from_toml_str(r#"
//!     database = "app.db"
//!     workers = 2
//!     isolation_level = "immediate"
//! "#).unwrap();
//! assert_eq!(config.worker_count(), 2);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// How long SQLite waits on a locked database before reporting busy.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Bounded wait of a worker's queue pop. A timeout is only a liveness tick.
pub const DEFAULT_IDLE_TICK_MS: u64 = 30_000;

/// Lifetime of an unused result channel before a sweep may drop it.
pub const DEFAULT_SESSION_TTL_MS: u64 = 5 * 60 * 1_000;

/// Environment variable prefix for config overrides.
pub const ENV_PREFIX: &str = "SQLITEMULTI_";

// =============================================================================
// Isolation Level
// =============================================================================

/// Transaction mode of every worker connection.
///
/// Mirrors the usual embedded-SQLite driver behaviour: unless the level is
/// [`IsolationLevel::Autocommit`], a `BEGIN <mode>` is issued implicitly
/// before the first INSERT/UPDATE/DELETE/REPLACE outside a transaction, and
/// changes only become durable on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// No implicit transactions; every statement commits on its own.
    Autocommit,
    /// `BEGIN DEFERRED`.
    #[default]
    Deferred,
    /// `BEGIN IMMEDIATE`.
    Immediate,
    /// `BEGIN EXCLUSIVE`.
    Exclusive,
}

impl IsolationLevel {
    /// The statement that opens a transaction in this mode.
    ///
    /// Batches always run inside a transaction, so autocommit connections
    /// fall back to a deferred `BEGIN` for them.
    pub fn begin_statement(self) -> &'static str {
        match self {
            IsolationLevel::Autocommit | IsolationLevel::Deferred => "BEGIN DEFERRED",
            IsolationLevel::Immediate => "BEGIN IMMEDIATE",
            IsolationLevel::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Configuration for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path (or `file:` URI when `uri` is set) of the database.
    pub database: String,

    /// SQLite busy timeout, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Implicit transaction mode.
    pub isolation_level: IsolationLevel,

    /// Interpret `database` as a URI.
    pub uri: bool,

    /// Run each worker as a child OS process instead of a thread.
    pub own_process: bool,

    /// Executable started for process workers. Defaults to the current
    /// executable, which must then call
    /// [`process::run_if_worker`](crate::process::run_if_worker) early in `main`.
    pub worker_program: Option<PathBuf>,

    /// Emit per-command debug events.
    pub verbose: bool,

    /// Number of workers. Values below 1 are treated as 1.
    pub workers: usize,

    /// Bounded wait of each worker's queue pop, in milliseconds.
    pub idle_tick_ms: u64,

    /// Registry TTL of a session's result channel, in milliseconds.
    pub session_ttl_ms: u64,

    /// Sweep expired sessions at the start of every dispatch.
    pub gc_on_dispatch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: String::new(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            isolation_level: IsolationLevel::default(),
            uri: false,
            own_process: false,
            worker_program: None,
            verbose: false,
            workers: 1,
            idle_tick_ms: DEFAULT_IDLE_TICK_MS,
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
            gc_on_dispatch: false,
        }
    }
}

impl Config {
    /// Default configuration for `database`.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Loads a TOML file, then applies `SQLITEMULTI_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Config::default()))
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Loads configuration from a TOML string only (no environment).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Config::default()))
                .merge(Toml::string(toml)),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the fields that have no usable default.
    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(Error::Config("`database` is required".to_string()));
        }
        Ok(())
    }

    /// Worker count, coerced up to 1.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
