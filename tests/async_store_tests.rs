//! Tests for AsynchronousDataStore
//!
//! These tests verify:
//! - Read-your-own-write before the flush runs
//! - Per-session FIFO flush order with several workers
//! - Failed flushes are counted and do not block later writes
//! - Counters are settled by the time flush() returns
//! - remove_data drops queued writes and never races a flush
//! - Queue-full policies (block, reject, bounded wait)
//! - Shutdown policies (flush, discard) and lifecycle errors

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pagestore::config::{AsyncConfig, Config, QueueFullPolicy, ShutdownPolicy};
use pagestore::{AsynchronousDataStore, DataStore, DiskDataStore, PageId, Result, StoreError};
use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;

// =============================================================================
// Test Store
// =============================================================================

/// In-memory DataStore whose writes can be paused and made to fail
#[derive(Default)]
struct MemoryStore {
    pages: Mutex<HashMap<(String, PageId), Bytes>>,

    /// Every successful store_data, in call order
    log: Mutex<Vec<(String, PageId, Bytes)>>,

    /// Sessions whose writes fail
    failing: Mutex<HashSet<String>>,

    paused: Mutex<bool>,
    resumed: Condvar,

    /// store_data calls that have started
    entered: AtomicUsize,

    destroyed: AtomicBool,
}

impl MemoryStore {
    fn pause(&self) {
        *self.paused.lock() = true;
    }

    fn resume(&self) {
        *self.paused.lock() = false;
        self.resumed.notify_all();
    }

    fn fail_session(&self, session_id: &str) {
        self.failing.lock().insert(session_id.to_string());
    }

    /// Wait until `count` store_data calls have started
    fn wait_entered(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.entered.load(Ordering::SeqCst) < count {
            assert!(Instant::now() < deadline, "worker never reached the store");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn logged(&self, session_id: &str) -> Vec<(PageId, Bytes)> {
        self.log
            .lock()
            .iter()
            .filter(|(s, _, _)| s == session_id)
            .map(|(_, p, d)| (*p, d.clone()))
            .collect()
    }
}

impl DataStore for MemoryStore {
    fn store_data(&self, session_id: &str, page_id: PageId, data: Bytes) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        {
            let mut paused = self.paused.lock();
            while *paused {
                self.resumed.wait(&mut paused);
            }
        }

        if self.failing.lock().contains(session_id) {
            return Err(StoreError::Io(std::io::Error::other("simulated disk failure")));
        }

        self.pages
            .lock()
            .insert((session_id.to_string(), page_id), data.clone());
        self.log.lock().push((session_id.to_string(), page_id, data));
        Ok(())
    }

    fn get_data(&self, session_id: &str, page_id: PageId) -> Result<Option<Bytes>> {
        Ok(self
            .pages
            .lock()
            .get(&(session_id.to_string(), page_id))
            .cloned())
    }

    fn remove_data(&self, session_id: &str) -> Result<()> {
        self.pages.lock().retain(|(s, _), _| s != session_id);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn async_config(workers: usize, capacity: usize) -> AsyncConfig {
    AsyncConfig {
        queue_capacity: capacity,
        worker_count: workers,
        ..AsyncConfig::default()
    }
}

fn setup_memory(config: AsyncConfig) -> (Arc<MemoryStore>, AsynchronousDataStore) {
    let inner = Arc::new(MemoryStore::default());
    let store = AsynchronousDataStore::new(inner.clone(), &config).unwrap();
    (inner, store)
}

fn setup_disk(quota: u64) -> (TempDir, Arc<DiskDataStore>, AsynchronousDataStore) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .root_dir(temp_dir.path())
        .max_size_per_session(quota)
        .worker_count(2)
        .build();
    let disk = Arc::new(DiskDataStore::open(config.clone()).unwrap());
    let store = AsynchronousDataStore::new(disk.clone(), &config.async_config).unwrap();
    (temp_dir, disk, store)
}

fn data(text: &str) -> Bytes {
    Bytes::from(text.to_string())
}

// =============================================================================
// Read-Your-Own-Write Tests
// =============================================================================

#[test]
fn test_read_your_own_write_before_flush() {
    let (inner, store) = setup_memory(async_config(1, 16));
    inner.pause();

    store.store_data("s1", 1, data("v1")).unwrap();

    // Not in the wrapped store yet, but visible through the wrapper
    assert_eq!(inner.get_data("s1", 1).unwrap(), None);
    assert_eq!(store.get_data("s1", 1).unwrap(), Some(data("v1")));
    assert_eq!(store.pending_count(), 1);

    inner.resume();
    store.flush();

    assert_eq!(store.pending_count(), 0);
    assert_eq!(inner.get_data("s1", 1).unwrap(), Some(data("v1")));
    assert_eq!(store.get_data("s1", 1).unwrap(), Some(data("v1")));
    assert_eq!(store.flushed_count(), 1);
}

#[test]
fn test_latest_pending_write_wins() {
    let (inner, store) = setup_memory(async_config(1, 16));
    inner.pause();

    store.store_data("s1", 1, data("v1")).unwrap();
    store.store_data("s1", 1, data("v2")).unwrap();
    store.store_data("s1", 1, data("v3")).unwrap();

    assert_eq!(store.get_data("s1", 1).unwrap(), Some(data("v3")));

    inner.resume();
    store.flush();

    // Every write reached the store, in order
    let logged: Vec<_> = inner.logged("s1").into_iter().map(|(_, d)| d).collect();
    assert_eq!(logged, vec![data("v1"), data("v2"), data("v3")]);
    assert_eq!(store.get_data("s1", 1).unwrap(), Some(data("v3")));
}

#[test]
fn test_get_falls_through_to_inner() {
    let (inner, store) = setup_memory(async_config(1, 16));

    inner.store_data("s1", 7, data("direct")).unwrap();

    assert_eq!(store.get_data("s1", 7).unwrap(), Some(data("direct")));
    assert_eq!(store.get_data("s1", 8).unwrap(), None);
}

#[test]
fn test_round_trip_over_disk_store() {
    let (_temp, disk, store) = setup_disk(1_000_000);

    for page_id in 0..50u64 {
        store
            .store_data("s1", page_id, Bytes::from(vec![page_id as u8; 1000]))
            .unwrap();
        assert_eq!(
            store.get_data("s1", page_id).unwrap(),
            Some(Bytes::from(vec![page_id as u8; 1000]))
        );
    }

    store.flush();

    for page_id in 0..50u64 {
        assert_eq!(
            disk.get_data("s1", page_id).unwrap(),
            Some(Bytes::from(vec![page_id as u8; 1000]))
        );
    }
}

#[test]
fn test_quota_scenario_through_async_layer() {
    let (_temp, disk, store) = setup_disk(1_000_000);

    for page_id in 1..=5u64 {
        store
            .store_data("s1", page_id, Bytes::from(vec![page_id as u8; 250_000]))
            .unwrap();
    }
    store.flush();

    assert_eq!(disk.page_ids("s1"), vec![2, 3, 4, 5]);
    assert_eq!(store.get_data("s1", 1).unwrap(), None);
    assert_eq!(
        store.get_data("s1", 5).unwrap(),
        Some(Bytes::from(vec![5u8; 250_000]))
    );
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_per_session_fifo_with_many_workers() {
    let (inner, store) = setup_memory(async_config(4, 64));

    for i in 0..50u64 {
        for s in 0..8 {
            let session = format!("s{}", s);
            store.store_data(&session, i, data(&format!("{}-{}", s, i))).unwrap();
        }
    }
    store.flush();

    for s in 0..8 {
        let pages: Vec<_> = inner
            .logged(&format!("s{}", s))
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(pages, (0..50).collect::<Vec<_>>());
    }
    assert_eq!(store.flushed_count(), 400);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_flush_does_not_block_others() {
    let (inner, store) = setup_memory(async_config(1, 16));
    inner.fail_session("bad");

    store.store_data("bad", 1, data("lost")).unwrap();
    store.store_data("good", 1, data("kept")).unwrap();
    store.flush();

    assert_eq!(store.failed_count(), 1);
    assert_eq!(store.flushed_count(), 1);
    assert_eq!(store.pending_count(), 0);

    // Fire-and-forget: the failed write is gone
    assert_eq!(store.get_data("bad", 1).unwrap(), None);
    assert_eq!(store.get_data("good", 1).unwrap(), Some(data("kept")));
}

// =============================================================================
// Counter Tests
// =============================================================================

#[test]
fn test_flushed_count_settled_when_flush_returns() {
    let (_temp, _disk, store) = setup_disk(1024 * 1024);

    for n in 1..=200u64 {
        store.store_data("s1", n, data("page")).unwrap();
        store.flush();
        assert_eq!(store.flushed_count(), n);
    }
    assert_eq!(store.failed_count(), 0);
}

#[test]
fn test_failed_count_settled_when_flush_returns() {
    let (inner, store) = setup_memory(async_config(2, 16));
    inner.fail_session("bad");

    for n in 1..=200u64 {
        store.store_data("bad", n, data("lost")).unwrap();
        store.store_data("good", n, data("kept")).unwrap();
        store.flush();
        assert_eq!(store.failed_count(), n);
        assert_eq!(store.flushed_count(), n);
    }
}

#[test]
fn test_discarded_count_settled_when_flush_returns() {
    let (inner, store) = setup_memory(async_config(1, 16));

    for round in 1..=50u64 {
        // Hold the worker inside a write to another session
        inner.pause();
        store.store_data("busy", round, data("blocker")).unwrap();
        inner.wait_entered(round as usize);

        store.store_data("s1", round, data("doomed")).unwrap();

        // remove_data waits on the held flush lock; release it only once
        // the queued write has been dropped
        thread::scope(|scope| {
            scope.spawn(|| {
                let deadline = Instant::now() + Duration::from_secs(5);
                while store.pending_count() > 1 {
                    assert!(Instant::now() < deadline, "queued write never dropped");
                    thread::sleep(Duration::from_millis(1));
                }
                inner.resume();
            });
            store.remove_data("s1").unwrap();
        });

        store.flush();
        assert_eq!(store.discarded_count(), round);
        assert_eq!(store.flushed_count(), round);
    }
}

// =============================================================================
// Removal Tests
// =============================================================================

#[test]
fn test_remove_drops_queued_writes() {
    let (inner, store) = setup_memory(async_config(1, 16));
    inner.pause();

    // First write is picked up and held inside the wrapped store
    store.store_data("other", 1, data("blocker")).unwrap();
    inner.wait_entered(1);

    store.store_data("s1", 1, data("v1")).unwrap();
    store.store_data("s1", 2, data("v2")).unwrap();
    assert_eq!(store.get_data("s1", 1).unwrap(), Some(data("v1")));

    // Only one worker, so the blocker's flush lock is the one remove waits on
    let remover = {
        let inner = Arc::clone(&inner);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inner.resume();
        })
    };
    store.remove_data("s1").unwrap();
    remover.join().unwrap();

    assert_eq!(store.get_data("s1", 1).unwrap(), None);
    assert_eq!(store.get_data("s1", 2).unwrap(), None);

    store.flush();

    assert!(inner.logged("s1").is_empty());
    assert_eq!(store.discarded_count(), 2);
    assert_eq!(inner.logged("other").len(), 1);
}

#[test]
fn test_remove_waits_for_in_flight_flush() {
    let (inner, store) = setup_memory(async_config(1, 16));
    let store = Arc::new(store);
    inner.pause();

    store.store_data("s1", 1, data("in flight")).unwrap();
    inner.wait_entered(1);

    let removed = Arc::new(AtomicBool::new(false));
    let remover = {
        let store = Arc::clone(&store);
        let removed = Arc::clone(&removed);
        thread::spawn(move || {
            store.remove_data("s1").unwrap();
            removed.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!removed.load(Ordering::SeqCst), "remove overtook an in-flight flush");

    inner.resume();
    remover.join().unwrap();

    // The flush landed first and the removal cleared it: no resurrection
    assert_eq!(inner.logged("s1").len(), 1);
    assert_eq!(inner.get_data("s1", 1).unwrap(), None);
    assert_eq!(store.get_data("s1", 1).unwrap(), None);
}

#[test]
fn test_store_after_remove_is_flushed() {
    let (inner, store) = setup_memory(async_config(1, 16));
    inner.pause();

    store.store_data("s1", 1, data("old")).unwrap();
    inner.wait_entered(1);
    store.store_data("s1", 2, data("dropped")).unwrap();

    let resumer = {
        let inner = Arc::clone(&inner);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inner.resume();
        })
    };
    store.remove_data("s1").unwrap();
    resumer.join().unwrap();

    store.store_data("s1", 3, data("new")).unwrap();
    store.flush();

    assert_eq!(store.get_data("s1", 2).unwrap(), None);
    assert_eq!(store.get_data("s1", 3).unwrap(), Some(data("new")));
    assert_eq!(store.discarded_count(), 1);
}

// =============================================================================
// Backpressure Tests
// =============================================================================

#[test]
fn test_reject_policy_returns_busy() {
    let config = AsyncConfig {
        queue_full_policy: QueueFullPolicy::Reject,
        ..async_config(1, 1)
    };
    let (inner, store) = setup_memory(config);
    inner.pause();

    store.store_data("s1", 1, data("in flight")).unwrap();
    inner.wait_entered(1);
    store.store_data("s1", 2, data("queued")).unwrap();

    assert!(matches!(
        store.store_data("s1", 3, data("rejected")),
        Err(StoreError::Busy)
    ));

    // A rejected write leaves no trace
    assert_eq!(store.get_data("s1", 3).unwrap(), None);
    assert_eq!(store.pending_count(), 2);

    inner.resume();
    store.flush();
    assert_eq!(inner.logged("s1").len(), 2);
}

#[test]
fn test_block_for_policy_times_out() {
    let config = AsyncConfig {
        queue_full_policy: QueueFullPolicy::BlockFor(Duration::from_millis(50)),
        ..async_config(1, 1)
    };
    let (inner, store) = setup_memory(config);
    inner.pause();

    store.store_data("s1", 1, data("in flight")).unwrap();
    inner.wait_entered(1);
    store.store_data("s1", 2, data("queued")).unwrap();

    let started = Instant::now();
    let result = store.store_data("s1", 3, data("late"));

    assert!(matches!(result, Err(StoreError::Busy)));
    assert!(started.elapsed() >= Duration::from_millis(50));

    inner.resume();
    store.flush();
}

#[test]
fn test_block_policy_waits_for_space() {
    let (inner, store) = setup_memory(async_config(1, 1));
    let store = Arc::new(store);
    inner.pause();

    store.store_data("s1", 1, data("a")).unwrap();
    inner.wait_entered(1);
    store.store_data("s1", 2, data("b")).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            store.store_data("s1", 3, data("c")).unwrap();
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "store_data did not block on a full queue");

    inner.resume();
    writer.join().unwrap();
    store.flush();

    let pages: Vec<_> = inner.logged("s1").into_iter().map(|(p, _)| p).collect();
    assert_eq!(pages, vec![1, 2, 3]);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_destroy_flushes_pending_writes() {
    let (inner, store) = setup_memory(async_config(2, 256));
    inner.pause();

    for i in 0..20u64 {
        store.store_data("s1", i, data(&format!("v{}", i))).unwrap();
    }

    let resumer = {
        let inner = Arc::clone(&inner);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inner.resume();
        })
    };
    store.destroy().unwrap();
    resumer.join().unwrap();

    assert_eq!(inner.logged("s1").len(), 20);
    assert!(inner.destroyed.load(Ordering::SeqCst));
    assert_eq!(store.flushed_count(), 20);
}

#[test]
fn test_destroy_discard_policy_drops_queue() {
    let config = AsyncConfig {
        shutdown_policy: ShutdownPolicy::Discard,
        ..async_config(1, 16)
    };
    let (inner, store) = setup_memory(config);
    inner.pause();

    store.store_data("s1", 1, data("in flight")).unwrap();
    inner.wait_entered(1);
    store.store_data("s1", 2, data("queued")).unwrap();
    store.store_data("s1", 3, data("queued")).unwrap();

    let resumer = {
        let inner = Arc::clone(&inner);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inner.resume();
        })
    };
    store.destroy().unwrap();
    resumer.join().unwrap();

    // The in-flight write completes, the queued ones never reach the store
    let pages: Vec<_> = inner.logged("s1").into_iter().map(|(p, _)| p).collect();
    assert_eq!(pages, vec![1]);
    assert_eq!(store.discarded_count(), 2);
    assert!(inner.destroyed.load(Ordering::SeqCst));
}

#[test]
fn test_calls_after_destroy_fail() {
    let (_inner, store) = setup_memory(async_config(1, 16));

    store.destroy().unwrap();

    assert!(store.is_destroyed());
    assert!(matches!(
        store.store_data("s1", 1, data("x")),
        Err(StoreError::Destroyed)
    ));
    assert!(matches!(store.get_data("s1", 1), Err(StoreError::Destroyed)));
    assert!(matches!(store.remove_data("s1"), Err(StoreError::Destroyed)));

    // Idempotent
    store.destroy().unwrap();
}

#[test]
fn test_destroy_destroys_disk_store() {
    let (_temp, disk, store) = setup_disk(1_000_000);

    store.store_data("s1", 1, data("x")).unwrap();
    store.destroy().unwrap();

    assert!(disk.is_destroyed());
    assert!(!disk.store_dir().exists());
}

#[test]
fn test_drop_flushes_without_destroying_inner() {
    let (inner, store) = setup_memory(async_config(1, 16));

    for i in 0..10u64 {
        store.store_data("s1", i, data("x")).unwrap();
    }
    drop(store);

    assert_eq!(inner.logged("s1").len(), 10);
    assert!(!inner.destroyed.load(Ordering::SeqCst));
}

#[test]
fn test_invalid_config_rejected() {
    let inner: Arc<dyn DataStore> = Arc::new(MemoryStore::default());

    assert!(matches!(
        AsynchronousDataStore::new(inner.clone(), &async_config(0, 16)),
        Err(StoreError::Config(_))
    ));
    assert!(matches!(
        AsynchronousDataStore::new(inner, &async_config(1, 0)),
        Err(StoreError::Config(_))
    ));
}
