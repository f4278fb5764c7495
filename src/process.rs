//! # Process-Isolated Workers
//!
//! With `own_process = true` each worker runs in a child OS process. The
//! worker loop is the same [`Worker`] used by thread workers; only the
//! transport around it changes:
//!
//! ```text
//!  parent process                               child process
//! ┌─────────────────────────────┐              ┌──────────────────────────────┐
//! │ Session ──► ProcessQueue ───┼── stdin ────►│ pipe reader ──► mpsc ──► Worker│
//! │    ▲         (pending ids)  │              │                           │    │
//! │    └──── router thread ◄────┼── stdout ◄───┼──────── Reply frames ◄────┘    │
//! └─────────────────────────────┘              └──────────────────────────────┘
//! ```
//!
//! ## Wire Format
//!
//! Newline-delimited JSON. The parent writes one [`Request`] per line; the
//! child answers with [`Frame`]s. The first frame is always `ready` or
//! `startup_failed`, so a connection error in the child surfaces from
//! `Dispatcher::connect` exactly like it does for thread workers.
//!
//! A line the child cannot decode (for example an operation kind it does not
//! know) is logged, answered with a protocol failure when its `id` can still
//! be read, and skipped. The worker keeps running. The parent's router treats
//! an unreadable reply frame the same way, so its caller is never left
//! waiting. When the child exits, every reply still owed is answered with a
//! disconnected failure.
//!
//! ## Worker Programs
//!
//! The child is `Config::worker_program`, or the current executable when
//! unset. Any binary can act as a worker program by calling
//! [`run_if_worker`] first thing in `main`; the bundled
//! `sqlitemulti-worker` binary does nothing else. Worker programs must keep
//! stdout free of anything but frames (log to stderr).

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::types::{Command, Failure, Reply};
use crate::worker::{ChannelReply, Envelope, ReplyTo, Worker};

/// Environment variable carrying the JSON config to a worker process.
pub const WORKER_CONFIG_ENV: &str = "SQLITEMULTI_WORKER_CONFIG";

// =============================================================================
// Wire Frames
// =============================================================================

/// Parent -> child: one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Routing id, unique per worker process.
    pub id: u64,
    pub command: Command,
    /// Whether the parent waits for a reply.
    pub reply: bool,
}

/// Child -> parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Ready,
    StartupFailed { message: String },
    Reply { id: u64, reply: Reply },
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_line<W: Write + ?Sized, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

// =============================================================================
// Child Side
// =============================================================================

/// Reply route of a command that arrived over the pipe.
pub struct PipeReply {
    id: u64,
    out: SharedWriter,
}

impl PipeReply {
    /// Writes the reply frame. Returns `false` if the pipe is closed.
    pub fn send(self, reply: Reply) -> bool {
        let frame = Frame::Reply { id: self.id, reply };
        let mut out = lock(&self.out);
        write_line(&mut **out, &frame).is_ok()
    }
}

impl fmt::Debug for PipeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReply").field("id", &self.id).finish()
    }
}

/// Serves one worker over a pair of byte streams.
///
/// Opens the database, announces `ready` (or `startup_failed`), then runs the
/// worker loop until a `Stop` request arrives or `input` reaches EOF.
///
/// # Errors
///
/// The connection error, after it has been reported to the parent.
pub fn serve<R, W>(input: R, output: W, config: &Config) -> Result<()>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let out: SharedWriter = Arc::new(Mutex::new(Box::new(output)));

    let engine = match Engine::open(config) {
        Ok(engine) => engine,
        Err(err) => {
            let frame = Frame::StartupFailed {
                message: err.to_string(),
            };
            write_line(&mut **lock(&out), &frame)?;
            return Err(err);
        }
    };
    write_line(&mut **lock(&out), &Frame::Ready)?;

    let (inbox_tx, inbox_rx) = mpsc::channel();
    let reader_out = Arc::clone(&out);
    // Detached: it may sit in a blocking read after the worker has stopped.
    thread::Builder::new()
        .name("sqlitemulti-pipe-reader".to_string())
        .spawn(move || read_requests(input, inbox_tx, reader_out))?;

    let name = format!("sqlitemulti-process-{}", std::process::id());
    Worker::new(name, engine, config).run(inbox_rx);
    Ok(())
}

fn read_requests<R: BufRead>(input: R, inbox: Sender<Envelope>, out: SharedWriter) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "worker stdin failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let reply_to = request.reply.then(|| {
                    ReplyTo::Pipe(PipeReply {
                        id: request.id,
                        out: Arc::clone(&out),
                    })
                });
                let envelope = Envelope {
                    command: request.command,
                    reply_to,
                };
                if inbox.send(envelope).is_err() {
                    // worker loop has exited
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "unreadable request frame");
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64));
                if let Some(id) = id {
                    let reply = PipeReply {
                        id,
                        out: Arc::clone(&out),
                    };
                    reply.send(Err(Failure::protocol(format!("unrecognized request: {err}"))));
                }
            }
        }
    }
}

/// Runs as a worker process if this process was started as one.
///
/// Returns `Ok(false)` immediately when [`WORKER_CONFIG_ENV`] is not set, so
/// it is safe to call unconditionally at the top of `main`:
///
/// ```rust,no_run
/// fn main() {
///     if sqlitemulti::process::run_if_worker().unwrap_or(true) {
///         return;
///     }
///     // ... regular program ...
/// }
/// ```
pub fn run_if_worker() -> Result<bool> {
    let Ok(raw) = std::env::var(WORKER_CONFIG_ENV) else {
        return Ok(false);
    };
    let config: Config = serde_json::from_str(&raw)?;
    serve(BufReader::new(std::io::stdin()), std::io::stdout(), &config)?;
    Ok(true)
}

// =============================================================================
// Parent Side
// =============================================================================

type PendingReplies = Arc<Mutex<HashMap<u64, ChannelReply>>>;

/// Producer side of a worker process's queue.
pub struct ProcessQueue {
    pid: u32,
    stdin: Mutex<BufWriter<ChildStdin>>,
    next_id: AtomicU64,
    pending: PendingReplies,
}

impl ProcessQueue {
    /// Writes one request line. Reply routes are parked until the router
    /// thread sees the matching reply frame.
    pub fn push(&self, envelope: Envelope) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = match envelope.reply_to {
            Some(ReplyTo::Channel(channel)) => {
                lock(&self.pending).insert(id, channel);
                true
            }
            Some(ReplyTo::Pipe(_)) => {
                return Err(Error::Protocol(
                    "pipe reply routes cannot be forwarded to another process".to_string(),
                ))
            }
            None => false,
        };

        let request = Request {
            id,
            command: envelope.command,
            reply,
        };
        let written = write_line(&mut *lock(&self.stdin), &request);
        if written.is_err() && reply {
            if let Some(channel) = lock(&self.pending).remove(&id) {
                channel.discard();
            }
        }
        written
    }

    /// OS process id of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl fmt::Debug for ProcessQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessQueue")
            .field("pid", &self.pid)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

/// The child process and its reply router, for `join()`.
#[derive(Debug)]
pub struct ProcessWorker {
    name: String,
    child: Child,
    router: JoinHandle<()>,
}

impl ProcessWorker {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the child to exit and the router to drain.
    pub fn join(mut self) -> Result<()> {
        let status = self.child.wait()?;
        self.router
            .join()
            .map_err(|_| Error::WorkerPanicked(format!("{}-router", self.name)))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Disconnected(format!(
                "worker process {} exited with {status}",
                self.name
            )))
        }
    }
}

/// Starts a worker process and waits for its `ready` frame.
///
/// # Errors
///
/// [`Error::Connection`] if the child reports a startup failure or exits
/// without announcing itself; an I/O error if it cannot be started.
pub fn spawn(index: usize, config: &Config) -> Result<(ProcessQueue, ProcessWorker)> {
    let program = match &config.worker_program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };

    let mut child = std::process::Command::new(&program)
        .env(WORKER_CONFIG_ENV, serde_json::to_string(config)?)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(Error::Disconnected("worker process pipes unavailable".to_string()));
    };

    let mut stdout = BufReader::new(stdout);
    let mut first = String::new();
    stdout.read_line(&mut first)?;

    match serde_json::from_str::<Frame>(first.trim()) {
        Ok(Frame::Ready) => {}
        Ok(Frame::StartupFailed { message }) => {
            let _ = child.wait();
            return Err(Error::Connection {
                database: config.database.clone(),
                message,
            });
        }
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Connection {
                database: config.database.clone(),
                message: format!("worker program {} did not report ready", program.display()),
            });
        }
    }

    let name = format!("sqlitemulti-process-{index}");
    let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

    let router = {
        let pending = Arc::clone(&pending);
        let name = name.clone();
        thread::Builder::new()
            .name(format!("{name}-router"))
            .spawn(move || route_replies(stdout, pending, &name))?
    };

    debug!(worker = %name, pid = child.id(), "worker process ready");

    let queue = ProcessQueue {
        pid: child.id(),
        stdin: Mutex::new(BufWriter::new(stdin)),
        next_id: AtomicU64::new(1),
        pending,
    };
    Ok((queue, ProcessWorker { name, child, router }))
}

fn route_replies<R: BufRead>(stdout: R, pending: PendingReplies, name: &str) {
    for line in stdout.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(worker = %name, error = %err, "worker stdout failed");
                break;
            }
        };

        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Reply { id, reply }) => match lock(&pending).remove(&id) {
                Some(channel) => {
                    channel.send(reply);
                }
                None => warn!(worker = %name, id, "reply for unknown request"),
            },
            Ok(other) => warn!(worker = %name, frame = ?other, "unexpected frame"),
            Err(err) => {
                warn!(worker = %name, error = %err, "unreadable reply frame");
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64));
                let channel = id.and_then(|id| lock(&pending).remove(&id));
                if let Some(channel) = channel {
                    channel.send(Err(Failure::protocol(format!("unreadable reply: {err}"))));
                }
            }
        }
    }

    // The child is gone; nobody else will answer these.
    let orphans: Vec<ChannelReply> = lock(&pending).drain().map(|(_, channel)| channel).collect();
    for channel in orphans {
        channel.send(Err(Failure::disconnected(format!(
            "worker process {name} exited"
        ))));
    }
    debug!(worker = %name, "reply router finished");
}

// =============================================================================
// Tests
// =============================================================================
