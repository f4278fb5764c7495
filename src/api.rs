//! # Async API for sqlitemulti
//!
//! Session calls block the calling thread until a worker answers. That is
//! the right shape for plain threads, but inside a Tokio runtime a blocked
//! task pins one of the runtime's worker threads. This module wraps the
//! blocking calls so async code can `await` them instead:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                Tokio Runtime                 │
//! │                                              │
//! │  task1 ─┐                                    │
//! │  task2 ─┼─ AsyncSession::insert(..).await    │
//! │  task3 ─┘          │                         │
//! │                    ▼                         │
//! │         spawn_blocking (blocking pool)       │
//! │                    │ Session::insert         │
//! └────────────────────┼─────────────────────────┘
//!                      ▼
//!          ┌───────────────────────┐
//!          │  Worker thread / proc │  ← owns the connection
//!          └───────────────────────┘
//! ```
//!
//! ## Why spawn_blocking?
//!
//! The workers already serialize access to the connection, so there is
//! nothing to gain from an async queue in front of them. The only job left
//! is to keep the blocking wait off the async executor, which is exactly
//! what `tokio::task::spawn_blocking` is for.
//!
//! ## Rust Concepts
//!
//! - **`&mut self` on async methods**: an [`AsyncSession`] has at most one
//!   call in flight, mirroring the `!Sync` blocking [`Session`]
//! - **`Arc<Dispatcher>`**: sessions keep the dispatcher alive for as long
//!   as they exist

use std::sync::Arc;

use tokio::task;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Session, Status};
use crate::error::{Error, Result};
use crate::types::{Batch, Command, Outcome, Params, Row, SessionId};

/// Runs `f` on Tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| Error::Disconnected(format!("blocking task failed: {err}")))?
}

// =============================================================================
// AsyncDispatcher
// =============================================================================

/// Async handle to a [`Dispatcher`].
///
/// `Clone`, `Send` and `Sync`: clones share the same workers.
///
/// # Example
///
/// ```rust,no_run
/// use sqlitemulti::api::AsyncDispatcher;
/// use sqlitemulti::Config;
///
/// #[tokio::main]
/// async fn main() -> sqlitemulti::Result<()> {
///     let db = AsyncDispatcher::connect(Config::new("app.db")).await?;
///     let mut session = db.attach();
///
///     session.execute("CREATE TABLE IF NOT EXISTS t (a TEXT)", (), true).await?;
///     session.insert("INSERT INTO t VALUES (?)", ("hi",)).await?;
///     let row = session.fetch_one("SELECT a FROM t", ()).await?;
///     println!("{row:?}");
///
///     db.shutdown().await
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AsyncDispatcher {
    inner: Arc<Dispatcher>,
}

impl AsyncDispatcher {
    /// Starts the workers without blocking the runtime.
    pub async fn connect(config: Config) -> Result<Self> {
        let dispatcher = blocking(move || Dispatcher::connect(config)).await?;
        Ok(Self::from_dispatcher(dispatcher))
    }

    /// Wraps an already connected dispatcher.
    pub fn from_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(dispatcher),
        }
    }

    /// The blocking dispatcher underneath.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner
    }

    pub fn attach(&self) -> AsyncSession {
        let id = self.inner.attach().id();
        self.session(id)
    }

    pub fn session(&self, id: SessionId) -> AsyncSession {
        AsyncSession {
            dispatcher: Arc::clone(&self.inner),
            id,
        }
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    pub fn collect_garbage(&self) -> usize {
        self.inner.collect_garbage()
    }

    pub fn forget(&self, id: SessionId) -> bool {
        self.inner.forget(id)
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stops the workers and waits for all of them to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.stop();
        let inner = Arc::clone(&self.inner);
        blocking(move || inner.join()).await
    }
}

// =============================================================================
// AsyncSession
// =============================================================================

/// Async counterpart of [`Session`]. Methods take `&mut self`: one call in
/// flight per session.
#[derive(Debug)]
pub struct AsyncSession {
    dispatcher: Arc<Dispatcher>,
    id: SessionId,
}

impl AsyncSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    async fn call<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let dispatcher = Arc::clone(&self.dispatcher);
        let id = self.id;
        blocking(move || f(&dispatcher.session(id))).await
    }

    pub async fn dispatch(&mut self, command: Command) -> Result<Outcome> {
        self.call(move |s| s.dispatch(command)).await
    }

    pub async fn execute(
        &mut self,
        sql: impl Into<String>,
        params: impl Into<Params>,
        commit: bool,
    ) -> Result<bool> {
        let (sql, params) = (sql.into(), params.into());
        self.call(move |s| s.execute(sql, params, commit)).await
    }

    pub async fn execute_batch(&mut self, batch: Batch) -> Result<Option<usize>> {
        self.call(move |s| s.execute_batch(batch)).await
    }

    pub async fn execute_many(&mut self, sql: impl Into<String>, params: Vec<Params>) -> Result<bool> {
        let sql = sql.into();
        self.call(move |s| s.execute_many(sql, params)).await
    }

    pub async fn insert(&mut self, sql: impl Into<String>, params: impl Into<Params>) -> Result<bool> {
        let (sql, params) = (sql.into(), params.into());
        self.call(move |s| s.insert(sql, params)).await
    }

    pub async fn insert_batch(&mut self, batch: Batch) -> Result<Option<usize>> {
        self.call(move |s| s.insert_batch(batch)).await
    }

    pub async fn delete(&mut self, sql: impl Into<String>, params: impl Into<Params>) -> Result<bool> {
        let (sql, params) = (sql.into(), params.into());
        self.call(move |s| s.delete(sql, params)).await
    }

    pub async fn delete_batch(&mut self, batch: Batch) -> Result<Option<usize>> {
        self.call(move |s| s.delete_batch(batch)).await
    }

    pub async fn fetch_one(
        &mut self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> Result<Option<Row>> {
        let (sql, params) = (sql.into(), params.into());
        self.call(move |s| s.fetch_one(sql, params)).await
    }

    pub async fn fetch_all(&mut self, sql: impl Into<String>, params: impl Into<Params>) -> Result<Vec<Row>> {
        let (sql, params) = (sql.into(), params.into());
        self.call(move |s| s.fetch_all(sql, params)).await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.call(|s| s.commit()).await
    }

    /// Releases this session's result channel.
    pub fn detach(self) -> bool {
        self.dispatcher.forget(self.id)
    }
}

// =============================================================================
// Tests
// =============================================================================
