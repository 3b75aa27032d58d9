//! pagestore stress tool
//!
//! Hammers a page store from many threads and verifies every read.

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use pagestore::{AsynchronousDataStore, Config, DataStore, DiskDataStore, PageId};
use tracing_subscriber::{fmt, EnvFilter};

/// pagestore stress test
#[derive(Parser, Debug)]
#[command(name = "pagestore-stress")]
#[command(about = "Concurrent store/read stress test for the page store")]
#[command(version)]
struct Args {
    /// Root directory for the store
    #[arg(short, long, default_value_t = std::env::temp_dir().join("pagestore-stress").display().to_string())]
    root_dir: String,

    /// Number of worker threads issuing operations
    #[arg(short, long, default_value = "8")]
    threads: usize,

    /// Number of distinct sessions
    #[arg(short, long, default_value = "32")]
    sessions: usize,

    /// Pages written per thread
    #[arg(short, long, default_value = "2000")]
    pages: usize,

    /// Blob size in bytes
    #[arg(short, long, default_value = "4096")]
    blob_size: usize,

    /// Per-session quota in KB
    #[arg(short = 'q', long, default_value = "256")]
    quota_kb: u64,

    /// File handle pool capacity
    #[arg(long, default_value = "16")]
    pool_capacity: usize,

    /// Route writes through the write-behind layer
    #[arg(short = 'a', long)]
    asynchronous: bool,

    /// Write-behind workers (with --asynchronous)
    #[arg(short, long, default_value = "2")]
    workers: usize,
}

/// Outcome counters shared by all threads
#[derive(Default)]
struct Tally {
    stored: AtomicU64,
    read_ok: AtomicU64,
    read_missing: AtomicU64,
    mismatches: AtomicU64,
    errors: AtomicU64,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pagestore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("pagestore stress v{}", pagestore::VERSION);
    tracing::info!("Root directory: {}", args.root_dir);

    let config = Config::builder()
        .root_dir(&args.root_dir)
        .application_name("stress")
        .max_size_per_session(args.quota_kb * 1024)
        .file_channel_pool_capacity(args.pool_capacity)
        .worker_count(args.workers)
        .build();

    let disk = match DiskDataStore::open(config.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store: Arc<dyn DataStore> = if args.asynchronous {
        match AsynchronousDataStore::new(disk.clone(), &config.async_config) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!("Failed to start write-behind layer: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        disk.clone()
    };

    let tally = Arc::new(Tally::default());
    let started = Instant::now();

    let handles: Vec<_> = (0..args.threads)
        .map(|t| {
            let store = Arc::clone(&store);
            let tally = Arc::clone(&tally);
            let sessions = args.sessions.max(1);
            let pages = args.pages;
            let blob_size = args.blob_size;
            thread::spawn(move || run_thread(&*store, &tally, t, sessions, pages, blob_size))
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("Stress thread panicked");
            tally.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    let elapsed = started.elapsed();
    tracing::info!(
        stored = tally.stored.load(Ordering::Relaxed),
        read_ok = tally.read_ok.load(Ordering::Relaxed),
        read_missing = tally.read_missing.load(Ordering::Relaxed),
        mismatches = tally.mismatches.load(Ordering::Relaxed),
        errors = tally.errors.load(Ordering::Relaxed),
        open_channels = disk.open_channels(),
        "Finished in {:?}",
        elapsed
    );

    if let Err(e) = store.destroy() {
        tracing::error!("Failed to destroy store: {}", e);
        return ExitCode::FAILURE;
    }

    if tally.mismatches.load(Ordering::Relaxed) > 0 || tally.errors.load(Ordering::Relaxed) > 0 {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Store pages round-robin over the sessions, reading each one back
///
/// Page ids embed the thread number so threads never overwrite each
/// other's pages; a read may still find a page evicted by quota.
fn run_thread(
    store: &dyn DataStore,
    tally: &Tally,
    thread_no: usize,
    sessions: usize,
    pages: usize,
    blob_size: usize,
) {
    for i in 0..pages {
        let session_id = format!("session-{}", (thread_no + i) % sessions);
        let page_id = ((thread_no as PageId) << 32) | i as PageId;
        let blob = make_blob(page_id, blob_size);

        if let Err(e) = store.store_data(&session_id, page_id, blob.clone()) {
            tracing::warn!("store_data failed: {}", e);
            tally.errors.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        tally.stored.fetch_add(1, Ordering::Relaxed);

        match store.get_data(&session_id, page_id) {
            Ok(Some(read)) if read == blob => {
                tally.read_ok.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(_)) => {
                tracing::error!(session = %session_id, page_id, "Read back different bytes");
                tally.mismatches.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                tally.read_missing.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("get_data failed: {}", e);
                tally.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Deterministic blob contents derived from the page id
fn make_blob(page_id: PageId, size: usize) -> Bytes {
    let seed = page_id.to_le_bytes();
    (0..size)
        .map(|i| seed[i % seed.len()] ^ (i as u8))
        .collect::<Vec<u8>>()
        .into()
}
