//! Asynchronous Data Store
//!
//! Write-behind decorator: `store_data` queues the write and returns,
//! background workers hand queued writes to the wrapped store.
//!
//! ## Queue Layout
//! ```text
//!                    hash(session) % workers
//!  store_data ──► ┌─────────┐ ──► worker 0 ──┐
//!                 │ shard 0 │                │
//!                 ├─────────┤                ├──► wrapped DataStore
//!                 │ shard 1 │ ──► worker 1 ──┘
//!                 └─────────┘
//!  get_data ───► PendingSet (latest queued write per page) ──miss──► wrapped
//! ```
//! All writes of a session land in the same shard, so they are flushed in
//! enqueue order. Sessions in different shards flush in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::config::{AsyncConfig, QueueFullPolicy, ShutdownPolicy};
use crate::error::{Result, StoreError};

use super::pending::{PendingSet, PendingWrite, WriteState};
use super::{DataStore, PageId};

/// Upper bound for a single condvar wait; waiters re-check state after it
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Write-behind wrapper around any `DataStore`
///
/// ## Concurrency:
/// - `queue`: one mutex over the pending set and the shard senders. A write
///   is sent and registered under it, so a worker never sees a write the
///   pending set does not know about
/// - `flush_locks[shard]`: held by the shard's worker for one flush, and by
///   `remove_data` for that session's shard, so a removal never interleaves
///   with a flush of the same session
/// - `progress`: signalled whenever a write leaves a shard or completes
///
/// Lock order: flush lock → queue.
pub struct AsynchronousDataStore {
    shared: Arc<Shared>,

    /// Worker threads, joined on shutdown
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Number of shards (= workers)
    shard_count: usize,

    queue_full_policy: QueueFullPolicy,
}

struct Shared {
    inner: Arc<dyn DataStore>,

    queue: Mutex<QueueState>,
    progress: Condvar,

    flush_locks: Vec<Mutex<()>>,

    shutdown_policy: ShutdownPolicy,

    /// Set by a discarding shutdown; workers skip what is left
    discarding: AtomicBool,

    flushed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

struct QueueState {
    /// One sender per shard; `None` once shut down
    senders: Option<Vec<Sender<PendingWrite>>>,

    pending: PendingSet,

    /// Writes sent to a shard and not yet processed by its worker,
    /// including ones that became moot
    outstanding: usize,
}

impl AsynchronousDataStore {
    /// Wrap `inner` and start `worker_count` flush workers
    pub fn new(inner: Arc<dyn DataStore>, config: &AsyncConfig) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(StoreError::Config(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if config.worker_count == 0 {
            return Err(StoreError::Config(
                "worker_count must be positive".to_string(),
            ));
        }

        let shard_count = config.worker_count;
        let shard_capacity = config.queue_capacity.div_ceil(shard_count);

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shard_count)
            .map(|_| channel::bounded::<PendingWrite>(shard_capacity))
            .unzip();

        let shared = Arc::new(Shared {
            inner,
            queue: Mutex::new(QueueState {
                senders: Some(senders),
                pending: PendingSet::default(),
                outstanding: 0,
            }),
            progress: Condvar::new(),
            flush_locks: (0..shard_count).map(|_| Mutex::new(())).collect(),
            shutdown_policy: config.shutdown_policy,
            discarding: AtomicBool::new(false),
            flushed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(shard_count);
        for (shard, receiver) in receivers.into_iter().enumerate() {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("pagestore-flush-{}", shard))
                .spawn(move || run_worker(worker_shared, shard, receiver))?;
            workers.push(handle);
        }

        tracing::debug!(
            workers = shard_count,
            shard_capacity,
            policy = ?config.queue_full_policy,
            "Started write-behind workers"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            shard_count,
            queue_full_policy: config.queue_full_policy,
        })
    }

    /// Block until every queued write has been flushed, failed or discarded
    ///
    /// Returns immediately after shutdown.
    pub fn flush(&self) {
        let mut queue = self.shared.queue.lock();
        while queue.outstanding > 0 && queue.senders.is_some() {
            self.shared.progress.wait_for(&mut queue, WAIT_SLICE);
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Writes queued and not yet flushed
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Writes successfully handed to the wrapped store
    pub fn flushed_count(&self) -> u64 {
        self.shared.flushed.load(Ordering::SeqCst)
    }

    /// Writes the wrapped store rejected
    pub fn failed_count(&self) -> u64 {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Writes dropped by `remove_data` or a discarding shutdown
    pub fn discarded_count(&self) -> u64 {
        self.shared.discarded.load(Ordering::SeqCst)
    }

    /// The wrapped store
    pub fn inner(&self) -> &Arc<dyn DataStore> {
        &self.shared.inner
    }

    pub fn worker_count(&self) -> usize {
        self.shard_count
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.queue.lock().senders.is_none()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn shard_for(&self, session_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        (hasher.finish() % self.shard_count as u64) as usize
    }

    /// Stop accepting writes, settle the queue per the shutdown policy and
    /// join the workers. Returns false if already stopped.
    fn stop_workers(&self) -> bool {
        {
            let mut queue = self.shared.queue.lock();
            let Some(senders) = queue.senders.take() else {
                return false;
            };

            if self.shared.shutdown_policy == ShutdownPolicy::Discard {
                self.shared.discarding.store(true, Ordering::SeqCst);
                let dropped = queue.pending.clear();
                tracing::info!(dropped, "Discarding queued writes on shutdown");
            } else {
                tracing::info!(
                    queued = queue.pending.len(),
                    "Flushing queued writes on shutdown"
                );
            }

            // Workers drain their channel and exit once it is empty
            drop(senders);
            self.shared.progress.notify_all();
        }

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("Write-behind worker panicked");
            }
        }

        true
    }
}

impl DataStore for AsynchronousDataStore {
    fn store_data(&self, session_id: &str, page_id: PageId, data: Bytes) -> Result<()> {
        let shard = self.shard_for(session_id);
        let deadline = match self.queue_full_policy {
            QueueFullPolicy::BlockFor(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };

        let mut write = PendingWrite::new(session_id, page_id, data);
        let mut queue = self.shared.queue.lock();

        loop {
            let QueueState {
                senders,
                pending,
                outstanding,
            } = &mut *queue;
            let Some(senders) = senders.as_ref() else {
                return Err(StoreError::Destroyed);
            };

            pending.prepare(&mut write);
            let queued = write.clone();
            match senders[shard].try_send(write) {
                Ok(()) => {
                    // The worker cannot look at it before we release the lock
                    pending.register(&queued);
                    *outstanding += 1;
                    tracing::trace!(
                        session = %session_id,
                        page_id,
                        ticket = queued.ticket(),
                        "Queued page write"
                    );
                    return Ok(());
                }
                Err(TrySendError::Disconnected(_)) => return Err(StoreError::Destroyed),
                Err(TrySendError::Full(returned)) => {
                    write = returned;
                }
            }

            match self.queue_full_policy {
                QueueFullPolicy::Reject => return Err(StoreError::Busy),
                QueueFullPolicy::Block => {
                    self.shared.progress.wait_for(&mut queue, WAIT_SLICE);
                }
                QueueFullPolicy::BlockFor(_) => {
                    let now = Instant::now();
                    let deadline = deadline.unwrap_or(now);
                    if now >= deadline {
                        return Err(StoreError::Busy);
                    }
                    self.shared
                        .progress
                        .wait_for(&mut queue, (deadline - now).min(WAIT_SLICE));
                }
            }
        }
    }

    fn get_data(&self, session_id: &str, page_id: PageId) -> Result<Option<Bytes>> {
        {
            let queue = self.shared.queue.lock();
            if queue.senders.is_none() {
                return Err(StoreError::Destroyed);
            }
            if let Some(data) = queue.pending.lookup(session_id, page_id) {
                return Ok(Some(data));
            }
        }

        self.shared.inner.get_data(session_id, page_id)
    }

    fn remove_data(&self, session_id: &str) -> Result<()> {
        // Queued writes of the session become moot right away
        {
            let mut queue = self.shared.queue.lock();
            if queue.senders.is_none() {
                return Err(StoreError::Destroyed);
            }
            let dropped = queue.pending.drop_session(session_id);
            if dropped > 0 {
                tracing::debug!(session = %session_id, dropped, "Dropped queued writes of removed session");
            }
        }

        // Wait out a flush already past its validity check
        let shard = self.shard_for(session_id);
        let _flush_guard = self.shared.flush_locks[shard].lock();

        self.shared.inner.remove_data(session_id)
    }

    fn destroy(&self) -> Result<()> {
        self.stop_workers();
        self.shared.inner.destroy()
    }
}

impl Drop for AsynchronousDataStore {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn run_worker(shared: Arc<Shared>, shard: usize, receiver: Receiver<PendingWrite>) {
    tracing::trace!(shard, "Write-behind worker started");

    // Ends once the senders are dropped and the channel is drained
    for write in receiver.iter() {
        shared.flush_one(shard, write);
    }

    tracing::trace!(shard, "Write-behind worker stopped");
}

impl Shared {
    /// Count a processed write
    ///
    /// Must run under the queue lock before `outstanding` drops, so that
    /// `flush()` never returns ahead of the counters.
    fn record(&self, state: WriteState) {
        let counter = match state {
            WriteState::Flushed => &self.flushed,
            WriteState::Failed => &self.failed,
            WriteState::Discarded => &self.discarded,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Hand one dequeued write to the wrapped store
    fn flush_one(&self, shard: usize, write: PendingWrite) -> WriteState {
        let _flush_guard = self.flush_locks[shard].lock();

        // Start flushing, unless the write became moot
        {
            let mut queue = self.queue.lock();
            // A channel slot just freed up
            self.progress.notify_all();

            if self.discarding.load(Ordering::SeqCst) || !queue.pending.is_current(&write) {
                self.record(WriteState::Discarded);
                queue.outstanding -= 1;
                return WriteState::Discarded;
            }
        }

        let state = match self
            .inner
            .store_data(&write.session_id, write.page_id, write.data.clone())
        {
            Ok(()) => WriteState::Flushed,
            Err(e) => {
                tracing::error!(
                    session = %write.session_id,
                    page_id = write.page_id,
                    queued_for = ?write.enqueued_at.elapsed(),
                    "Failed to flush page write: {}",
                    e
                );
                WriteState::Failed
            }
        };

        {
            let mut queue = self.queue.lock();
            queue.pending.complete(&write);
            self.record(state);
            queue.outstanding -= 1;
            self.progress.notify_all();
        }

        state
    }
}
