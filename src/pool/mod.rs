//! File Channel Pool Module
//!
//! Bounded cache of open file handles shared by every session.
//!
//! ## Responsibilities
//! - Open session files lazily and reuse the handle across operations
//! - Keep at most `capacity` handles open while they are idle
//! - Evict the least recently used *unreferenced* handle when full
//! - Never close a handle that is currently borrowed
//!
//! ## Structure
//! ```text
//! ┌──────────────────────── Mutex<PoolState> ────────────────────────┐
//! │  clock: u64 (logical time, bumped on every acquire)              │
//! │                                                                  │
//! │  slots: HashMap<PathBuf, Slot>                                   │
//! │  ┌──────────────┬────┬───────────┬───────────┬─────────────────┐ │
//! │  │ path         │ id │ last_used │ ref_count │ Arc<Mutex<File>>│ │
//! │  └──────────────┴────┴───────────┴───────────┴─────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Borrowing returns a [`PooledChannel`] guard; dropping it releases the
//! reference. When every handle is borrowed the pool grows past capacity
//! and shrinks back as guards are released.

mod channel;

pub use channel::{FileChannelPool, PooledChannel};
