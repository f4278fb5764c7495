//! # Dispatcher
//!
//! The caller-facing side of sqlitemulti. A [`Dispatcher`] starts the
//! workers, hands out [`Session`]s, and routes every session call to a
//! worker queue and back:
//!
//! ```text
//!   Session::insert(sql, params)
//!        │
//!        ▼
//!   registry.checkout(session) ──► ResultChannel (created on first use)
//!        │
//!        ▼
//!   next_queue() ── round-robin ──► queue[i].push(Envelope { command, reply_to })
//!                                         │
//!                                         ▼
//!                                   Worker i (FIFO)
//!                                         │
//!   receiver.recv() ◄──────── Reply ──────┘
//! ```
//!
//! ## Blocking
//!
//! Session calls block the calling thread until the worker answers. There is
//! no timeout: the call returns when the worker replies, or when the worker
//! is gone (a [`Error::Disconnected`] failure). Use [`crate::api`] from async
//! code.
//!
//! ## Ordering
//!
//! With one worker, commands run in the order they were enqueued. With
//! several, each worker is FIFO on its own queue but there is no global order
//! across workers, and a write on one worker is only visible to another
//! after it commits.
//!
//! ## Shutdown
//!
//! [`Dispatcher::stop`] pushes one `Stop` to every queue and returns.
//! [`Dispatcher::join`] then waits for every worker to exit. Commands still
//! queued behind a `Stop` are not run; their callers get a disconnected
//! failure.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::process;
use crate::queue::{CommandQueue, QueueStats, WorkerHandle};
use crate::registry::Registry;
use crate::types::{Batch, Command, Outcome, Params, Row, SessionId, Statement, WriteKind};
use crate::worker::{self, ChannelReply, Envelope, ReplyTo};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Shared State
// =============================================================================

/// State shared by the dispatcher and every session it issued.
#[derive(Debug)]
struct Shared {
    queues: Vec<CommandQueue>,
    stats: Vec<Arc<QueueStats>>,
    /// Index of the queue the next command goes to.
    cursor: Mutex<usize>,
    registry: Registry,
    stopping: AtomicBool,
    next_session: AtomicU64,
    verbose: bool,
    gc_on_dispatch: bool,
}

impl Shared {
    fn new(queues: Vec<CommandQueue>, config: &Config) -> Self {
        let stats = queues.iter().map(|_| Arc::new(QueueStats::default())).collect();
        Self {
            queues,
            stats,
            cursor: Mutex::new(0),
            registry: Registry::new(config.session_ttl()),
            stopping: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
            verbose: config.verbose,
            gc_on_dispatch: config.gc_on_dispatch,
        }
    }

    /// Picks the queue for the next command: use the current index, then
    /// advance it.
    fn next_queue(&self) -> usize {
        if self.queues.len() == 1 {
            return 0;
        }
        let mut cursor = lock(&self.cursor);
        let index = *cursor;
        *cursor = (index + 1) % self.queues.len();
        index
    }

    /// Sends one command for `session` and blocks until its reply arrives.
    fn dispatch(&self, session: SessionId, command: Command) -> Result<Outcome> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::Misuse("dispatcher has been stopped".to_string()));
        }
        if matches!(command, Command::Stop) {
            return Err(Error::Misuse(
                "workers are stopped through Dispatcher::stop".to_string(),
            ));
        }
        if self.gc_on_dispatch {
            let swept = self.registry.sweep();
            if swept > 0 {
                debug!(swept, "expired result channels removed");
            }
        }

        let channel = self.registry.checkout(session);
        let index = self.next_queue();
        if self.verbose {
            debug!(%session, worker = index, command = command.name(), "dispatching");
        }

        // Held across push and receive: two handles for the same session id
        // must not pick up each other's replies.
        let receiver = channel
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let stats = &self.stats[index];
        stats.begin();
        let envelope = Envelope {
            command,
            reply_to: Some(ReplyTo::Channel(ChannelReply::new(channel.sender.clone()))),
        };
        if let Err(err) = self.queues[index].push(envelope) {
            stats.finish();
            return Err(err);
        }

        let reply = receiver.recv();
        stats.finish();
        let reply = reply.map_err(|_| Error::Disconnected(format!("result channel of {session} closed")))?;
        reply.map_err(Error::from)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Owns the workers and hands out sessions.
///
/// # Thread Safety
///
/// `Dispatcher` is `Send` and `Sync`. Share it behind an `Arc` and call
/// [`attach`](Self::attach) from every thread that needs the database.
///
/// # Example
///
/// ```rust,no_run
/// use sqlitemulti::{Config, Dispatcher};
///
/// fn main() -> sqlitemulti::Result<()> {
///     let dispatcher = Dispatcher::connect(Config::new("app.db"))?;
///     let session = dispatcher.attach();
///
///     session.execute("CREATE TABLE IF NOT EXISTS t (a TEXT)", (), true)?;
///     session.insert("INSERT INTO t (a) VALUES (?)", ("hello",))?;
///     let rows = session.fetch_all("SELECT a FROM t", ())?;
///     println!("{} rows", rows.len());
///
///     dispatcher.stop();
///     dispatcher.join()
/// }
/// ```
#[derive(Debug)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Dispatcher {
    /// Starts `config.workers` workers and waits until each has opened its
    /// connection.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid configuration, [`Error::Connection`]
    /// if any worker cannot open the database. Workers that already started
    /// are stopped and joined before the error is returned.
    pub fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let count = config.worker_count();

        let mut queues = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let started = if config.own_process {
                process::spawn(index, &config)
                    .map(|(queue, worker)| (CommandQueue::Process(queue), WorkerHandle::Process(worker)))
            } else {
                worker::spawn_thread(index, &config).map(|(tx, handle)| {
                    let name = handle
                        .thread()
                        .name()
                        .map_or_else(|| format!("worker-{index}"), str::to_string);
                    (CommandQueue::Thread(tx), WorkerHandle::Thread { name, handle })
                })
            };

            match started {
                Ok((queue, worker)) => {
                    queues.push(queue);
                    workers.push(worker);
                }
                Err(err) => {
                    warn!(worker = index, error = %err, "worker failed to start");
                    shut_down(&queues, workers);
                    return Err(err);
                }
            }
        }

        info!(
            database = %config.database,
            workers = count,
            own_process = config.own_process,
            "dispatcher connected"
        );

        Ok(Self {
            shared: Arc::new(Shared::new(queues, &config)),
            workers: Mutex::new(workers),
        })
    }

    /// Issues a session with a fresh id.
    pub fn attach(&self) -> Session {
        let id = SessionId::new(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        self.session(id)
    }

    /// A session handle for a caller-chosen id.
    ///
    /// Handles that share an id share one result channel; their calls are
    /// serialized against each other.
    pub fn session(&self, id: SessionId) -> Session {
        Session {
            shared: Arc::clone(&self.shared),
            id,
            _not_sync: PhantomData,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// Snapshot of queue occupancy and registered result channels.
    pub fn status(&self) -> Status {
        let workers = self
            .shared
            .stats
            .iter()
            .zip(&self.shared.queues)
            .enumerate()
            .map(|(index, (stats, queue))| WorkerStatus {
                index,
                pid: queue.pid(),
                in_flight: stats.in_flight(),
                dispatched: stats.dispatched(),
            })
            .collect();
        let sessions = self
            .shared
            .registry
            .snapshot()
            .into_iter()
            .map(|(id, expires_in)| SessionStatus { id, expires_in })
            .collect();
        Status {
            workers,
            sessions,
            stopping: self.is_stopping(),
        }
    }

    /// Removes every expired result channel. Returns how many were removed.
    pub fn collect_garbage(&self) -> usize {
        let swept = self.shared.registry.sweep();
        debug!(swept, remaining = self.shared.registry.len(), "garbage collected");
        swept
    }

    /// Removes one session's result channel. Returns whether it existed.
    pub fn forget(&self, id: SessionId) -> bool {
        self.shared.registry.forget(id)
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Signals every worker to stop and returns without waiting.
    ///
    /// Calling it again is a no-op. Any dispatch after this fails with
    /// [`Error::Misuse`]. Worker processes of a dispatcher dropped without
    /// [`join`](Self::join) are waited on by a background thread, so they do
    /// not linger as zombies.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(workers = self.shared.queues.len(), "stop requested");
        for (index, queue) in self.shared.queues.iter().enumerate() {
            if let Err(err) = queue.push(Envelope::stop()) {
                debug!(worker = index, error = %err, "worker already gone");
            }
        }
    }

    /// Waits until every worker has exited.
    ///
    /// # Errors
    ///
    /// [`Error::Misuse`] if [`stop`](Self::stop) was not called first.
    /// Otherwise the first worker failure (a panicked thread or a worker
    /// process that exited unsuccessfully), after all workers were waited on.
    pub fn join(&self) -> Result<()> {
        if !self.is_stopping() {
            return Err(Error::Misuse("join() called before stop()".to_string()));
        }

        let workers = std::mem::take(&mut *lock(&self.workers));
        let mut first_error = None;
        for worker in workers {
            let name = worker.name().to_string();
            match worker.join() {
                Ok(()) => debug!(worker = %name, "worker joined"),
                Err(err) => {
                    warn!(worker = %name, error = %err, "worker exited abnormally");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("all workers joined");
                Ok(())
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();

        // Thread handles detach on drop. Children must still be waited on, but
        // one stuck in a long statement must not block the drop.
        let children: Vec<WorkerHandle> = std::mem::take(&mut *lock(&self.workers))
            .into_iter()
            .filter(|worker| matches!(worker, WorkerHandle::Process(_)))
            .collect();
        if children.is_empty() {
            return;
        }
        let reaper = thread::Builder::new()
            .name("sqlitemulti-reaper".to_string())
            .spawn(move || {
                for child in children {
                    let name = child.name().to_string();
                    if let Err(err) = child.join() {
                        debug!(worker = %name, error = %err, "worker process exited abnormally");
                    }
                }
            });
        if let Err(err) = reaper {
            warn!(error = %err, "cannot start worker process reaper");
        }
    }
}

/// Stops and waits for the workers started so far by a `connect` that failed.
fn shut_down(queues: &[CommandQueue], workers: Vec<WorkerHandle>) {
    for queue in queues {
        let _ = queue.push(Envelope::stop());
    }
    for worker in workers {
        let _ = worker.join();
    }
}

// =============================================================================
// Session
// =============================================================================

/// One caller's handle for issuing commands.
///
/// `Send` but not `Sync`: a session can move to another thread, but it
/// cannot wait on two replies at once. Attach one session per thread or
/// task.
///
/// Sessions keep the dispatcher's shared state alive, but once the
/// dispatcher is stopped every call fails with [`Error::Misuse`].
#[derive(Debug)]
pub struct Session {
    shared: Arc<Shared>,
    id: SessionId,
    _not_sync: PhantomData<Cell<()>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Sends a raw command and returns the worker's outcome.
    pub fn dispatch(&self, command: Command) -> Result<Outcome> {
        self.shared.dispatch(self.id, command)
    }

    fn write(&self, kind: WriteKind, statement: Statement, commit: bool) -> Result<Outcome> {
        self.dispatch(Command::Write {
            kind,
            statement,
            commit,
        })
    }

    /// Runs one statement, committing afterwards when `commit` is set.
    pub fn execute(&self, sql: impl Into<String>, params: impl Into<Params>, commit: bool) -> Result<bool> {
        self.write(WriteKind::Execute, Statement::single(sql, params), commit)?
            .into_done()
    }

    /// Runs a batch in one transaction.
    ///
    /// Returns `Some(n)` when all `n` statements were applied and committed,
    /// `None` when one of them failed and the whole batch was rolled back.
    pub fn execute_batch(&self, batch: Batch) -> Result<Option<usize>> {
        self.write(WriteKind::Execute, batch.into(), true)?
            .into_applied()
    }

    /// Runs `sql` once per parameter set, then commits.
    pub fn execute_many<I, P>(&self, sql: impl Into<String>, params: I) -> Result<bool>
    where
        I: IntoIterator<Item = P>,
        P: Into<Params>,
    {
        self.dispatch(Command::ExecuteMany {
            sql: sql.into(),
            params: params.into_iter().map(Into::into).collect(),
        })?
        .into_done()
    }

    /// Runs an INSERT and commits.
    pub fn insert(&self, sql: impl Into<String>, params: impl Into<Params>) -> Result<bool> {
        self.write(WriteKind::Insert, Statement::single(sql, params), true)?
            .into_done()
    }

    pub fn insert_batch(&self, batch: Batch) -> Result<Option<usize>> {
        self.write(WriteKind::Insert, batch.into(), true)?
            .into_applied()
    }

    /// Runs a DELETE and commits.
    pub fn delete(&self, sql: impl Into<String>, params: impl Into<Params>) -> Result<bool> {
        self.write(WriteKind::Delete, Statement::single(sql, params), true)?
            .into_done()
    }

    pub fn delete_batch(&self, batch: Batch) -> Result<Option<usize>> {
        self.write(WriteKind::Delete, batch.into(), true)?
            .into_applied()
    }

    /// First row of the result, or `None` when there is none.
    pub fn fetch_one(&self, sql: impl Into<String>, params: impl Into<Params>) -> Result<Option<Row>> {
        self.dispatch(Command::FetchOne {
            sql: sql.into(),
            params: params.into(),
        })?
        .into_row()
    }

    /// Every row of the result.
    pub fn fetch_all(&self, sql: impl Into<String>, params: impl Into<Params>) -> Result<Vec<Row>> {
        self.dispatch(Command::FetchAll {
            sql: sql.into(),
            params: params.into(),
        })?
        .into_rows()
    }

    /// Commits the open transaction of whichever worker this call lands on.
    ///
    /// With several workers that is not necessarily the worker that ran the
    /// previous write; pass `commit = true` on the write instead.
    pub fn commit(&self) -> Result<()> {
        self.dispatch(Command::Commit)?.into_done().map(|_| ())
    }

    /// Releases this session's result channel. Returns whether one existed.
    pub fn detach(self) -> bool {
        self.shared.registry.forget(self.id)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Counters for one worker queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub index: usize,
    /// OS process id when the worker runs in its own process.
    pub pid: Option<u32>,
    /// Commands pushed whose reply has not been received yet.
    pub in_flight: usize,
    /// Commands ever routed to this worker.
    pub dispatched: u64,
}

/// One registered result channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: SessionId,
    pub expires_in: Duration,
}

/// Returned by [`Dispatcher::status`]. `Display` renders a short report:
///
/// ```text
/// 1 commands
///   worker 0: 1 in flight, 42 dispatched
/// 2 result queues
///   session-1: expires in 299.9s
///   session-2: expires in 12.0s
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub workers: Vec<WorkerStatus>,
    pub sessions: Vec<SessionStatus>,
    pub stopping: bool,
}

impl Status {
    /// Commands in flight across all workers.
    pub fn queued(&self) -> usize {
        self.workers.iter().map(|w| w.in_flight).sum()
    }

    pub fn dispatched(&self) -> u64 {
        self.workers.iter().map(|w| w.dispatched).sum()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} commands", self.queued())?;
        for worker in &self.workers {
            write!(f, "  worker {}", worker.index)?;
            if let Some(pid) = worker.pid {
                write!(f, " (pid {pid})")?;
            }
            writeln!(
                f,
                ": {} in flight, {} dispatched",
                worker.in_flight, worker.dispatched
            )?;
        }
        writeln!(f, "{} result queues", self.sessions.len())?;
        for session in &self.sessions {
            writeln!(
                f,
                "  {}: expires in {:.1}s",
                session.id,
                session.expires_in.as_secs_f64()
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn shared_with_queues(count: usize) -> (Shared, Vec<mpsc::Receiver<Envelope>>) {
        let mut queues = Vec::new();
        let mut inboxes = Vec::new();
        for _ in 0..count {
            let (tx, rx) = mpsc::channel();
            queues.push(CommandQueue::Thread(tx));
            inboxes.push(rx);
        }
        (Shared::new(queues, &Config::new(":memory:")), inboxes)
    }

    #[test]
    fn test_next_queue_uses_then_advances() {
        let (shared, _inboxes) = shared_with_queues(3);
        let picks: Vec<_> = (0..7).map(|_| shared.next_queue()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_single_queue_always_zero() {
        let (shared, _inboxes) = shared_with_queues(1);
        assert!((0..5).all(|_| shared.next_queue() == 0));
    }

    #[test]
    fn test_dispatch_after_stop_is_misuse() {
        let (shared, _inboxes) = shared_with_queues(1);
        shared.stopping.store(true, Ordering::Release);
        let err = shared.dispatch(SessionId::new(1), Command::Commit).unwrap_err();
        assert!(matches!(err, Error::Misuse(_)));
        // Nothing was registered for the rejected call.
        assert!(shared.registry.is_empty());
    }

    #[test]
    fn test_dispatch_stop_is_misuse() {
        let (shared, _inboxes) = shared_with_queues(1);
        let err = shared.dispatch(SessionId::new(1), Command::Stop).unwrap_err();
        assert!(matches!(err, Error::Misuse(_)));
    }

    #[test]
    fn test_dispatch_to_closed_queue_fails_fast() {
        let (shared, inboxes) = shared_with_queues(1);
        drop(inboxes);
        let err = shared.dispatch(SessionId::new(1), Command::Commit).unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
        assert_eq!(shared.stats[0].in_flight(), 0);
        assert_eq!(shared.stats[0].dispatched(), 1);
    }

    #[test]
    fn test_dropped_envelope_wakes_caller() {
        let (shared, inboxes) = shared_with_queues(1);
        let inbox = inboxes.into_iter().next().unwrap();
        // Swallow the envelope without answering, like a worker that stopped
        // with the command still queued.
        let drain = std::thread::spawn(move || drop(inbox.recv()));

        let err = shared.dispatch(SessionId::new(4), Command::Commit).unwrap_err();
        drain.join().unwrap();
        assert!(matches!(err, Error::Disconnected(_)));
    }

    #[test]
    fn test_status_display() {
        let status = Status {
            workers: vec![
                WorkerStatus { index: 0, pid: None, in_flight: 1, dispatched: 4 },
                WorkerStatus { index: 1, pid: Some(4242), in_flight: 0, dispatched: 3 },
            ],
            sessions: vec![SessionStatus {
                id: SessionId::new(2),
                expires_in: Duration::from_millis(1500),
            }],
            stopping: false,
        };

        assert_eq!(status.queued(), 1);
        assert_eq!(status.dispatched(), 7);
        assert_eq!(
            status.to_string(),
            "1 commands\n  worker 0: 1 in flight, 4 dispatched\n  worker 1 (pid 4242): 0 in flight, 3 dispatched\n1 result queues\n  session-2: expires in 1.5s\n"
        );
    }
}
