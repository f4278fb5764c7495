//! # Command Queues and Worker Handles
//!
//! The dispatcher talks to every worker through a [`CommandQueue`] and keeps
//! a [`WorkerHandle`] to wait for it on `join()`. Both come in two flavours,
//! picked by `Config::own_process`:
//!
//! | Mode | Queue | Handle |
//! |------|-------|--------|
//! | thread | `std::sync::mpsc::Sender<Envelope>` | `JoinHandle<()>` |
//! | process | JSON lines on the child's stdin | `Child` + reply router thread |
//!
//! Both queues have the same contract: `push` never blocks on the worker and
//! commands are handled in push order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{SendError, Sender};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::process::{ProcessQueue, ProcessWorker};
use crate::worker::Envelope;

// =============================================================================
// Queue Counters
// =============================================================================

/// Per-worker counters shown by `status()`.
///
/// Maintained by the dispatcher on the calling side: a command counts as in
/// flight from the moment it is pushed until its reply has been received.
#[derive(Debug, Default)]
pub struct QueueStats {
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
}

impl QueueStats {
    /// A command was handed to this worker.
    pub fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.dispatched.fetch_add(1, Ordering::AcqRel);
    }

    /// The reply to a command was received (or the push failed).
    pub fn finish(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Commands pushed but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Commands ever routed to this worker.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire)
    }
}

// =============================================================================
// Command Queue
// =============================================================================

/// The producer side of one worker's queue.
#[derive(Debug)]
pub enum CommandQueue {
    Thread(Sender<Envelope>),
    Process(ProcessQueue),
}

impl CommandQueue {
    /// Enqueues an envelope for the worker.
    ///
    /// # Errors
    ///
    /// [`Error::Disconnected`] if the worker thread is gone, or an I/O error
    /// if the worker process's pipe is closed.
    pub fn push(&self, envelope: Envelope) -> Result<()> {
        match self {
            CommandQueue::Thread(tx) => tx.send(envelope).map_err(|SendError(envelope)| {
                envelope.discard();
                Error::Disconnected("worker thread has shut down".to_string())
            }),
            CommandQueue::Process(queue) => queue.push(envelope),
        }
    }

    /// The worker's OS process id, for process workers.
    pub fn pid(&self) -> Option<u32> {
        match self {
            CommandQueue::Thread(_) => None,
            CommandQueue::Process(queue) => Some(queue.pid()),
        }
    }
}

// =============================================================================
// Worker Handle
// =============================================================================

/// What `join()` waits on.
#[derive(Debug)]
pub enum WorkerHandle {
    Thread { name: String, handle: JoinHandle<()> },
    Process(ProcessWorker),
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        match self {
            WorkerHandle::Thread { name, .. } => name,
            WorkerHandle::Process(worker) => worker.name(),
        }
    }

    /// Blocks until the worker has exited.
    pub fn join(self) -> Result<()> {
        match self {
            WorkerHandle::Thread { name, handle } => {
                handle.join().map_err(|_| Error::WorkerPanicked(name))
            }
            WorkerHandle::Process(worker) => worker.join(),
        }
    }
}
