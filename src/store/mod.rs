//! Store Module
//!
//! The `DataStore` contract and its two implementations.
//!
//! ## Layers
//! - [`DiskDataStore`]: synchronous, one lock-guarded `SessionStore` per session
//! - [`AsynchronousDataStore`]: write-behind decorator over any `DataStore`
//!
//! Both are `Send + Sync` and are meant to be shared behind an `Arc`.

mod disk;
mod pending;
mod asynchronous;

use bytes::Bytes;

use crate::error::Result;

pub use disk::DiskDataStore;
pub use pending::{PendingWrite, WriteState};
pub use asynchronous::AsynchronousDataStore;
pub use crate::session::SessionUsage;

/// Page identifier, unique within a session
pub type PageId = u64;

/// Storage contract consumed by the page serialization layer
///
/// - Blobs are opaque; the store never looks inside them
/// - A missing page is `Ok(None)`, never an error
/// - After `destroy` every call except `destroy` fails with
///   `StoreError::Destroyed`; `destroy` itself is idempotent
pub trait DataStore: Send + Sync {
    /// Store a page blob, superseding any earlier blob for the same page
    fn store_data(&self, session_id: &str, page_id: PageId, data: Bytes) -> Result<()>;

    /// Fetch a page blob
    fn get_data(&self, session_id: &str, page_id: PageId) -> Result<Option<Bytes>>;

    /// Remove every page of a session. Removing an unknown session is a no-op.
    fn remove_data(&self, session_id: &str) -> Result<()>;

    /// Release all resources. Terminal.
    fn destroy(&self) -> Result<()>;
}
