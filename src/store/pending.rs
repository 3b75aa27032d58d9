//! Pending writes of the write-behind layer
//!
//! Tracks which queued writes are still authoritative for reads.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;

use super::PageId;

/// Final outcome of a queued write
///
/// ```text
/// queued ──► flushing ──► Flushed
///                    └──► Failed
/// queued ──► Discarded      (session removed, or discarding shutdown)
/// ```
/// A write is readable until it reaches one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Flushed,
    Failed,
    Discarded,
}

/// A write waiting for a background worker
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub session_id: String,
    pub page_id: PageId,
    pub data: Bytes,
    pub enqueued_at: Instant,

    /// Global enqueue order
    ticket: u64,

    /// Incarnation of the session's pending entry; a removed session gets a
    /// new one, which invalidates writes still sitting in the channel
    generation: u64,
}

impl PendingWrite {
    pub fn new(session_id: &str, page_id: PageId, data: Bytes) -> Self {
        Self {
            session_id: session_id.to_string(),
            page_id,
            data,
            enqueued_at: Instant::now(),
            ticket: 0,
            generation: 0,
        }
    }

    /// Global enqueue order
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

/// Queued writes of one session
struct SessionPending {
    generation: u64,

    /// Most recent write per page: (ticket, data)
    latest: HashMap<PageId, (u64, Bytes)>,

    /// Writes registered but not yet completed
    queued: usize,
}

/// All writes not yet handed to the wrapped store
///
/// Not synchronized; lives inside the async store's queue mutex.
#[derive(Default)]
pub(crate) struct PendingSet {
    sessions: HashMap<String, SessionPending>,
    len: usize,
    next_ticket: u64,
    next_generation: u64,
}

impl PendingSet {
    /// Stamp ticket and generation on a write about to be queued
    ///
    /// Nothing is recorded until `register`, so a write that fails to enter
    /// the queue leaves no trace.
    pub fn prepare(&self, write: &mut PendingWrite) {
        write.ticket = self.next_ticket;
        write.generation = match self.sessions.get(&write.session_id) {
            Some(session) => session.generation,
            None => self.next_generation,
        };
    }

    /// Record a prepared write that entered the queue
    pub fn register(&mut self, write: &PendingWrite) {
        self.next_ticket = write.ticket + 1;
        if write.generation == self.next_generation {
            self.next_generation += 1;
        }

        let session = self
            .sessions
            .entry(write.session_id.clone())
            .or_insert_with(|| SessionPending {
                generation: write.generation,
                latest: HashMap::new(),
                queued: 0,
            });
        session
            .latest
            .insert(write.page_id, (write.ticket, write.data.clone()));
        session.queued += 1;
        self.len += 1;
    }

    /// Most recently queued data for a page
    pub fn lookup(&self, session_id: &str, page_id: PageId) -> Option<Bytes> {
        let session = self.sessions.get(session_id)?;
        session.latest.get(&page_id).map(|(_, data)| data.clone())
    }

    /// Whether a dequeued write should still reach the wrapped store
    pub fn is_current(&self, write: &PendingWrite) -> bool {
        self.sessions
            .get(&write.session_id)
            .is_some_and(|session| session.generation == write.generation)
    }

    /// Forget a write the worker is done with (flushed or failed)
    pub fn complete(&mut self, write: &PendingWrite) {
        let Some(session) = self.sessions.get_mut(&write.session_id) else {
            return;
        };
        if session.generation != write.generation {
            return;
        }

        if session
            .latest
            .get(&write.page_id)
            .is_some_and(|(ticket, _)| *ticket == write.ticket)
        {
            session.latest.remove(&write.page_id);
        }

        session.queued -= 1;
        self.len -= 1;

        if session.queued == 0 {
            self.sessions.remove(&write.session_id);
        }
    }

    /// Drop every queued write of a session; returns how many were dropped
    pub fn drop_session(&mut self, session_id: &str) -> usize {
        match self.sessions.remove(session_id) {
            Some(session) => {
                self.len -= session.queued;
                session.queued
            }
            None => 0,
        }
    }

    /// Drop everything; returns how many writes were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.sessions.clear();
        self.len = 0;
        dropped
    }

    /// Writes registered and not yet completed or dropped
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
