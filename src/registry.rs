//! # Result Channel Registry
//!
//! Each session gets one result channel, created on its first dispatch and
//! reused for every call after that. The registry maps session ids to those
//! channels and forgets them again, either when the session detaches or when
//! a sweep finds them expired.
//!
//! ## Expiration
//!
//! An entry expires `ttl` after it was last checked out. Nothing sweeps on a
//! timer: [`Registry::sweep`] runs only when the application (or a
//! dispatcher configured with `gc_on_dispatch`) asks for it.
//!
//! A sweep does not look at whether a channel is in use. That is safe here:
//! a call that already checked out its channel holds its own handles, so the
//! reply still reaches it; the next call from that session simply creates a
//! fresh entry.
//!
//! ## Locking
//!
//! One mutex guards the map. Lookup-or-create happens under a single lock
//! acquisition, so two first calls with the same session id can never end
//! up with two different channels.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::types::{Reply, SessionId};

/// One session's reply channel: the sender is cloned into every envelope,
/// the receiver is what the session blocks on.
#[derive(Debug, Clone)]
pub struct ResultChannel {
    pub sender: Sender<Reply>,
    pub receiver: Arc<Mutex<Receiver<Reply>>>,
}

impl ResultChannel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

#[derive(Debug)]
struct Entry {
    channel: ResultChannel,
    expires_at: Instant,
}

/// Session id -> result channel, with expiry.
#[derive(Debug)]
pub struct Registry {
    entries: Mutex<HashMap<SessionId, Entry>>,
    ttl: Duration,
}

impl Registry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the session's channel, creating it on first use, and pushes
    /// its expiration out to `now + ttl`.
    pub fn checkout(&self, id: SessionId) -> ResultChannel {
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.entries();
        let entry = entries.entry(id).or_insert_with(|| Entry {
            channel: ResultChannel::new(),
            expires_at,
        });
        entry.expires_at = expires_at;
        entry.channel.clone()
    }

    /// Drops the session's entry. Returns whether one existed.
    pub fn forget(&self, id: SessionId) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Drops every entry that has expired. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) against an explicit clock reading.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.entries().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(session, time left before expiry)` for every entry, sorted by id.
    pub fn snapshot(&self) -> Vec<(SessionId, Duration)> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .entries()
            .iter()
            .map(|(id, entry)| (*id, entry.expires_at.saturating_duration_since(now)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}
