//! # pagestore
//!
//! A bounded, disk-backed store for serialized page state with:
//! - One append-only file per session, indexed in memory
//! - A per-session byte quota enforced by evicting the oldest pages
//! - A shared LRU pool of open file handles
//! - An optional write-behind layer that flushes on background workers
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Page serialization layer                     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  DataStore
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                AsynchronousDataStore (optional)              │
//! │        pending set ──► sharded queue ──► flush workers       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  DataStore
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      DiskDataStore                           │
//! │          session id ──► Mutex<SessionStore>                  │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │  SessionStore   │ ──acquire────► │ FileChannelPool │
//!   │ (index + quota) │                │   (LRU, RAII)   │
//!   └─────────────────┘                └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod pool;
pub mod session;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{StoreError, Result};
pub use config::{AsyncConfig, Config, QueueFullPolicy, ShutdownPolicy};
pub use store::{AsynchronousDataStore, DataStore, DiskDataStore, PageId, SessionUsage};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of pagestore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
