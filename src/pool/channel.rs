//! File channel pool implementation
//!
//! HashMap of slots with a logical clock for LRU ordering.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

/// Bounded pool of open file handles keyed by path
///
/// ## Concurrency:
/// - All bookkeeping (lookup, ref counts, eviction scan) happens under one
///   mutex, so acquire/release are atomic with respect to eviction
/// - Files are opened outside the mutex; a racing acquire for the same
///   path keeps whichever handle was inserted first
/// - Each handle carries its own mutex for seek + read/write
pub struct FileChannelPool {
    /// Nominal number of handles kept open
    capacity: usize,

    /// Slots and LRU clock
    state: Mutex<PoolState>,
}

struct PoolState {
    slots: HashMap<PathBuf, Slot>,

    /// Logical time; bumped on every acquire
    clock: u64,

    /// Distinguishes a reopened path from a closed one
    next_id: u64,

    /// Set by `destroy`
    closed: bool,
}

struct Slot {
    id: u64,
    file: Arc<Mutex<File>>,
    last_used: u64,
    ref_count: usize,
}

impl FileChannelPool {
    /// Create an empty pool
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                clock: 0,
                next_id: 1,
                closed: false,
            }),
        }
    }

    /// Borrow the handle for `path`, opening (and creating) the file if needed
    ///
    /// The returned guard releases its reference on drop.
    pub fn acquire(&self, path: &Path) -> Result<PooledChannel<'_>> {
        // Fast path: handle already open
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::Destroyed);
            }
            if let Some((id, file)) = state.checkout(path) {
                return Ok(PooledChannel::new(self, path, id, file));
            }
        }

        // Slow path: open without holding the pool lock
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::Destroyed);
        }

        // Another thread opened the same path meanwhile; ours is dropped
        if let Some((id, file)) = state.checkout(path) {
            return Ok(PooledChannel::new(self, path, id, file));
        }

        state.evict_idle(self.capacity.saturating_sub(1));
        if state.slots.len() >= self.capacity {
            tracing::warn!(
                open = state.slots.len(),
                capacity = self.capacity,
                "All pooled file handles are in use, growing past capacity"
            );
        }

        state.clock += 1;
        let id = state.next_id;
        state.next_id += 1;

        let file = Arc::new(Mutex::new(file));
        let slot = Slot {
            id,
            file: Arc::clone(&file),
            last_used: state.clock,
            ref_count: 1,
        };
        state.slots.insert(path.to_path_buf(), slot);

        Ok(PooledChannel::new(self, path, id, file))
    }

    /// Close the handle for one path, e.g. before its file is deleted
    ///
    /// Outstanding guards keep their handle alive until dropped; their
    /// release is then a no-op.
    pub fn close(&self, path: &Path) {
        let mut state = self.state.lock();
        if state.slots.remove(path).is_some() {
            tracing::trace!(path = %path.display(), "Closed pooled file handle");
        }
    }

    /// Close every handle. Later acquires fail with `StoreError::Destroyed`.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.slots.clear();
    }

    /// Nominal capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of open handles (borrowed or idle)
    pub fn open_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of open handles nobody is currently borrowing
    pub fn idle_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| slot.ref_count == 0)
            .count()
    }

    /// Whether a handle for `path` is currently open
    pub fn is_open(&self, path: &Path) -> bool {
        self.state.lock().slots.contains_key(path)
    }

    /// Whether `destroy` has been called
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().closed
    }

    fn release(&self, path: &Path, id: u64) {
        let mut state = self.state.lock();
        match state.slots.get_mut(path) {
            Some(slot) if slot.id == id => {
                slot.ref_count -= 1;
            }
            // Closed or replaced while borrowed
            _ => return,
        }

        // Shrink back after a transient overshoot
        if state.slots.len() > self.capacity {
            state.evict_idle(self.capacity);
        }
    }
}

impl PoolState {
    /// Mark an open handle as used and take a reference to it
    fn checkout(&mut self, path: &Path) -> Option<(u64, Arc<Mutex<File>>)> {
        self.clock += 1;
        let clock = self.clock;

        let slot = self.slots.get_mut(path)?;
        slot.last_used = clock;
        slot.ref_count += 1;
        Some((slot.id, Arc::clone(&slot.file)))
    }

    /// Close idle handles, least recently used first, until at most
    /// `limit` remain or nothing idle is left
    fn evict_idle(&mut self, limit: usize) {
        while self.slots.len() > limit {
            let victim = self
                .slots
                .iter()
                .filter(|(_, slot)| slot.ref_count == 0)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(path, _)| path.clone());

            match victim {
                Some(path) => {
                    self.slots.remove(&path);
                    tracing::trace!(path = %path.display(), "Evicted idle file handle");
                }
                None => break,
            }
        }
    }
}

/// A borrowed file handle. Releases its pool reference on drop.
pub struct PooledChannel<'a> {
    pool: &'a FileChannelPool,
    path: PathBuf,
    id: u64,
    file: Arc<Mutex<File>>,
}

impl<'a> PooledChannel<'a> {
    fn new(pool: &'a FileChannelPool, path: &Path, id: u64, file: Arc<Mutex<File>>) -> Self {
        Self {
            pool,
            path: path.to_path_buf(),
            id,
            file,
        }
    }

    /// Write all of `data` starting at `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Read exactly `len` bytes starting at `offset`
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Current physical length of the file
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Path this handle was opened for
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PooledChannel<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.path, self.id);
    }
}
