//! # Worker Loop
//!
//! A worker owns one database connection and drains one command queue,
//! strictly in FIFO order, one command at a time. That single-threaded loop
//! is what serializes access to the connection: no lock around the
//! connection is needed because nothing else can reach it.
//!
//! ## State Machine
//!
//! ```text
//!   Starting ──open ok──► Running ──Stop / queue closed──► Stopped
//!      │
//!      └──open failed──► (error returned to Dispatcher::connect)
//! ```
//!
//! `Stopped` is terminal. A worker is never restarted.
//!
//! ## Per-Command Contract
//!
//! | Command | Reply | Commit afterwards |
//! |---------|-------|-------------------|
//! | `Write` single | `Done(true)` | if the command's flag is set |
//! | `Write` batch | `Applied(n)` / `Done(false)` after rollback | forced on success |
//! | `ExecuteMany` | `Done(true)` | forced |
//! | `FetchOne` / `FetchAll` | `Row` / `Rows` | no |
//! | `Commit` | `Done(true)` | (is the commit) |
//! | `Stop` | none | no, and nothing queued behind it runs |
//!
//! A failing command never ends the loop. Its error is logged and sent back
//! to the caller as a [`Failure`] so the caller is never left waiting.
//!
//! The same loop runs inside a worker thread and inside a worker process;
//! only the [`ReplyTo`] route of each envelope differs.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::process::PipeReply;
use crate::types::{Command, Failure, Outcome, Reply, Statement};

// =============================================================================
// Envelopes
// =============================================================================

/// Reply route into a session's result channel.
///
/// Dropping it unanswered (the worker stopped, or panicked, with the command
/// still queued) delivers a disconnected failure instead, so the caller
/// blocked on the channel always wakes up.
#[derive(Debug)]
pub struct ChannelReply(Option<Sender<Reply>>);

impl ChannelReply {
    pub fn new(tx: Sender<Reply>) -> Self {
        Self(Some(tx))
    }

    /// Publishes `reply`. Returns `false` if the receiving side is gone.
    pub fn send(mut self, reply: Reply) -> bool {
        match self.0.take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops the route without answering. Used when the command never made
    /// it onto a queue and the caller already got the error directly.
    pub fn discard(mut self) {
        self.0 = None;
    }
}

impl Drop for ChannelReply {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(Failure::disconnected(
                "worker stopped before answering the command",
            )));
        }
    }
}

/// Where a worker publishes the reply to one command.
#[derive(Debug)]
pub enum ReplyTo {
    /// In-process result channel of the calling session.
    Channel(ChannelReply),
    /// Reply frame on a worker process's stdout.
    Pipe(PipeReply),
}

impl ReplyTo {
    /// Publishes `reply`. Returns `false` if the receiving side is gone.
    pub fn send(self, reply: Reply) -> bool {
        match self {
            ReplyTo::Channel(channel) => channel.send(reply),
            ReplyTo::Pipe(pipe) => pipe.send(reply),
        }
    }
}

/// A command on its way to a worker, with its reply route.
///
/// `reply_to` is `None` only for fire-and-forget commands (`Stop`).
#[derive(Debug)]
pub struct Envelope {
    pub command: Command,
    pub reply_to: Option<ReplyTo>,
}

impl Envelope {
    /// The envelope `stop()` pushes to every queue.
    pub fn stop() -> Self {
        Self {
            command: Command::Stop,
            reply_to: None,
        }
    }

    /// Drops an envelope that was never enqueued, without answering it.
    pub fn discard(self) {
        if let Some(ReplyTo::Channel(channel)) = self.reply_to {
            channel.discard();
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Result of handling one command.
#[derive(Debug, PartialEq)]
pub enum Step {
    Reply(Reply),
    Stop,
}

/// The single owner of one database connection.
#[derive(Debug)]
pub struct Worker {
    name: String,
    engine: Engine,
    idle_tick: Duration,
    verbose: bool,
}

impl Worker {
    pub fn new(name: impl Into<String>, engine: Engine, config: &Config) -> Self {
        Self {
            name: name.into(),
            engine,
            idle_tick: config.idle_tick(),
            verbose: config.verbose,
        }
    }

    /// Runs until a `Stop` command arrives or every queue sender is dropped.
    pub fn run(mut self, inbox: Receiver<Envelope>) {
        info!(worker = %self.name, "worker running");

        loop {
            let envelope = match inbox.recv_timeout(self.idle_tick) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => {
                    trace!(worker = %self.name, "idle tick");
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!(worker = %self.name, "command queue closed");
                    break;
                }
            };

            let Envelope { command, reply_to } = envelope;
            if self.verbose {
                debug!(worker = %self.name, command = command.name(), "command received");
            }

            match self.step(command) {
                Step::Stop => {
                    info!(worker = %self.name, "worker stopping");
                    break;
                }
                Step::Reply(reply) => {
                    if let Some(route) = reply_to {
                        if !route.send(reply) {
                            debug!(worker = %self.name, "caller went away before its reply");
                        }
                    }
                }
            }
        }
    }

    /// Executes one command and, when asked, commits.
    ///
    /// A batch whose commit fails is rolled back and reported as
    /// `Done(false)`, the same as a batch whose statements fail.
    pub fn step(&mut self, command: Command) -> Step {
        let name = command.name();
        let batch = matches!(
            command,
            Command::Write {
                statement: Statement::Batch(_),
                ..
            }
        );
        match self.apply(command) {
            Ok(None) => Step::Stop,
            Ok(Some((outcome, commit))) => {
                if commit {
                    if let Err(err) = self.engine.commit() {
                        warn!(worker = %self.name, command = name, error = %err, "commit failed");
                        if !batch {
                            return Step::Reply(Err(Failure::statement(err.to_string())));
                        }
                        return match self.engine.rollback() {
                            Ok(()) => Step::Reply(Ok(Outcome::Done(false))),
                            Err(err) => Step::Reply(Err(Failure::statement(err.to_string()))),
                        };
                    }
                }
                Step::Reply(Ok(outcome))
            }
            Err(err) => {
                warn!(worker = %self.name, command = name, error = %err, "command failed");
                Step::Reply(Err(Failure::statement(err.to_string())))
            }
        }
    }

    /// Runs the statement part of a command.
    ///
    /// Returns the outcome plus whether a commit must follow, or `None` for
    /// `Stop`.
    fn apply(&mut self, command: Command) -> rusqlite::Result<Option<(Outcome, bool)>> {
        let applied = match command {
            Command::Write {
                statement: Statement::Single { sql, params },
                commit,
                ..
            } => {
                self.engine.execute(&sql, &params)?;
                (Outcome::Done(true), commit)
            }
            Command::Write {
                statement: Statement::Batch(batch),
                ..
            } => match self.engine.execute_batch(&batch) {
                Ok(applied) => (Outcome::Applied(applied), true),
                Err(err) => {
                    warn!(worker = %self.name, error = %err, "batch failed, rolling back");
                    self.engine.rollback()?;
                    (Outcome::Done(false), false)
                }
            },
            Command::ExecuteMany { sql, params } => {
                self.engine.execute_many(&sql, &params)?;
                (Outcome::Done(true), true)
            }
            Command::FetchOne { sql, params } => {
                (Outcome::Row(self.engine.fetch_one(&sql, &params)?), false)
            }
            Command::FetchAll { sql, params } => {
                (Outcome::Rows(self.engine.fetch_all(&sql, &params)?), false)
            }
            Command::Commit => {
                self.engine.commit()?;
                (Outcome::Done(true), false)
            }
            Command::Stop => return Ok(None),
        };
        Ok(Some(applied))
    }
}

// =============================================================================
// Thread Workers
// =============================================================================

/// Spawns a worker thread and waits until its connection is open.
///
/// # Errors
///
/// [`Error::Connection`] if the worker could not open the database. The
/// thread has already exited in that case.
pub fn spawn_thread(index: usize, config: &Config) -> Result<(Sender<Envelope>, JoinHandle<()>)> {
    let (request_tx, request_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

    let name = format!("sqlitemulti-worker-{index}");
    let thread_name = name.clone();
    let config = config.clone();

    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        let engine = match Engine::open(&config) {
            Ok(engine) => engine,
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));
        Worker::new(thread_name, engine, &config).run(request_rx);
    })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok((request_tx, handle)),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err)
        }
        Err(_) => Err(Error::WorkerPanicked(name)),
    }
}

// =============================================================================
// Tests
// =============================================================================
