//! Session Store Module
//!
//! One append-only data file per session plus an in-memory page index.
//!
//! ## Responsibilities
//! - Append page blobs at the end of the session file
//! - Index page id → (offset, length) in memory only
//! - Enforce the per-session quota by evicting the oldest pages
//! - Delete the session directory on removal
//!
//! ## File Format
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────
//! │ blob (seq 1) │ blob (seq 2) │ blob (seq 3) │ ...
//! └──────────────┴──────────────┴──────────────┴─────
//! ```
//! No framing: offsets, lengths and checksums live in the index, which is
//! not persisted. Superseded and evicted blobs stay in the file until the
//! session is removed.

mod store;

use std::collections::hash_map::DefaultHasher;
use std::fmt::Write;
use std::hash::{Hash, Hasher};

use crate::store::PageId;

pub use store::SessionStore;

/// Name of the data file inside each session directory
pub const DATA_FILENAME: &str = "data";

/// Longest directory name produced by `encode_session_id`
const MAX_ENCODED_LEN: usize = 128;

/// Location of one page blob inside a session file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub page_id: PageId,

    /// Byte offset in the session file
    pub offset: u64,

    /// Blob length in bytes
    pub length: u64,

    /// Per-session write counter; smallest is evicted first
    pub sequence: u64,

    /// CRC32 of the blob
    pub checksum: u32,
}

/// Disk usage of a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionUsage {
    /// Number of live pages
    pub entries: usize,

    /// Sum of the live pages' lengths (bounded by the quota)
    pub total_bytes: u64,

    /// Physical bytes appended to the session file, including dead blobs
    pub file_len: u64,
}

/// Turn a session id into a directory name that is safe on every filesystem
///
/// Lowercase ASCII letters, digits, `_` and `-` pass through; every other
/// byte becomes `%XX` with uppercase hex, so ids differing only in case
/// never collide on case-insensitive filesystems. The empty id maps to `%`.
/// Encodings longer than 128 bytes are truncated and tagged with `~` and a
/// hash of the full id.
pub fn encode_session_id(session_id: &str) -> String {
    if session_id.is_empty() {
        return "%".to_string();
    }

    let mut encoded = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{:02X}", byte);
        }
    }

    if encoded.len() > MAX_ENCODED_LEN {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);

        // ~ + 8 hex + 16 hex
        encoded.truncate(MAX_ENCODED_LEN - 25);
        let _ = write!(
            encoded,
            "~{:08x}{:016x}",
            crc32fast::hash(session_id.as_bytes()),
            hasher.finish()
        );
    }

    encoded
}
