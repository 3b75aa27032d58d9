//! SessionStore implementation
//!
//! Append-only session file with FIFO quota eviction.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::pool::FileChannelPool;
use crate::store::PageId;

use super::{encode_session_id, IndexEntry, SessionUsage, DATA_FILENAME};

/// Pages of a single session
///
/// Not internally synchronized: `DiskDataStore` wraps each one in a mutex,
/// so index, totals and the session file are only touched by the lock holder.
pub struct SessionStore {
    session_id: String,

    /// Session directory, created on first append
    dir: PathBuf,

    /// Data file inside `dir`
    path: PathBuf,

    /// Shared handle pool
    pool: Arc<FileChannelPool>,

    /// Byte quota for live pages
    quota: u64,

    /// Live entries ordered by sequence (oldest first)
    entries: BTreeMap<u64, IndexEntry>,

    /// page id → sequence of its live entry
    pages: HashMap<PageId, u64>,

    /// Sum of live entry lengths
    total_bytes: u64,

    /// Next append position in the data file
    end_offset: u64,

    next_sequence: u64,

    dir_created: bool,

    /// Set once `remove` ran; the owning map must not hand this out again
    removed: bool,
}

impl SessionStore {
    /// Create an empty session store under `store_dir`
    ///
    /// No filesystem access happens until the first append.
    pub fn new(
        session_id: &str,
        store_dir: &Path,
        pool: Arc<FileChannelPool>,
        quota: u64,
    ) -> Self {
        let dir = store_dir.join(encode_session_id(session_id));
        let path = dir.join(DATA_FILENAME);

        Self {
            session_id: session_id.to_string(),
            dir,
            path,
            pool,
            quota,
            entries: BTreeMap::new(),
            pages: HashMap::new(),
            total_bytes: 0,
            end_offset: 0,
            next_sequence: 1,
            dir_created: false,
            removed: false,
        }
    }

    /// Append a page blob, superseding any earlier copy of the same page
    ///
    /// Steps:
    /// 1. Write the blob at the end of the session file
    /// 2. Drop the superseded entry for this page, if any
    /// 3. Index the new entry
    /// 4. Evict the oldest entries while over quota
    ///
    /// If the write fails the index is left untouched.
    pub fn append(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        let length = data.len() as u64;

        // A blob bigger than the whole quota can never be retained
        if length > self.quota {
            tracing::warn!(
                session = %self.session_id,
                page_id,
                length,
                quota = self.quota,
                "Page exceeds the session quota and will not be stored"
            );
            self.drop_page(page_id);
            return Ok(());
        }

        if !self.dir_created {
            fs::create_dir_all(&self.dir)?;
            self.dir_created = true;
        }

        // Step 1: write at end of file
        let offset = self.end_offset;
        if length > 0 {
            let channel = self.pool.acquire(&self.path)?;
            channel.write_at(offset, data)?;
        }
        self.end_offset += length;

        // Step 2: latest write wins
        self.drop_page(page_id);

        // Step 3: index
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.entries.insert(
            sequence,
            IndexEntry {
                page_id,
                offset,
                length,
                sequence,
                checksum: crc32fast::hash(data),
            },
        );
        self.pages.insert(page_id, sequence);
        self.total_bytes += length;

        // Step 4: quota
        self.evict_over_quota();

        Ok(())
    }

    /// Read a page blob
    ///
    /// Returns:
    /// - `Ok(Some(bytes))`: page is live
    /// - `Ok(None)`: never stored, superseded by an oversized write, or evicted
    /// - `Err(Corruption)`: bytes on disk no longer match the checksum
    pub fn read(&self, page_id: PageId) -> Result<Option<Bytes>> {
        let entry = match self.entry(page_id) {
            Some(entry) => *entry,
            None => return Ok(None),
        };

        if entry.length == 0 {
            return Ok(Some(Bytes::new()));
        }

        let data = {
            let channel = self.pool.acquire(&self.path)?;
            channel.read_at(entry.offset, entry.length as usize)?
        };

        if crc32fast::hash(&data) != entry.checksum {
            return Err(StoreError::Corruption {
                session_id: self.session_id.clone(),
                page_id,
            });
        }

        Ok(Some(Bytes::from(data)))
    }

    /// Drop the index, close the pooled handle and delete the session directory
    pub fn remove(&mut self) -> Result<()> {
        self.removed = true;
        self.entries.clear();
        self.pages.clear();
        self.total_bytes = 0;
        self.end_offset = 0;

        self.pool.close(&self.path);

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.dir_created = false;

        tracing::debug!(session = %self.session_id, "Removed session store");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Index entry of a live page
    pub fn entry(&self, page_id: PageId) -> Option<&IndexEntry> {
        let sequence = self.pages.get(&page_id)?;
        self.entries.get(sequence)
    }

    /// Whether a page is live
    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains_key(&page_id)
    }

    /// Live page ids, oldest write first
    pub fn page_ids(&self) -> Vec<PageId> {
        self.entries.values().map(|entry| entry.page_id).collect()
    }

    /// Sum of live page lengths
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Number of live pages
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Physical bytes appended so far, live or not
    pub fn file_len(&self) -> u64 {
        self.end_offset
    }

    pub fn usage(&self) -> SessionUsage {
        SessionUsage {
            entries: self.entries.len(),
            total_bytes: self.total_bytes,
            file_len: self.end_offset,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Session directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Data file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Forget the live entry of a page, if any
    fn drop_page(&mut self, page_id: PageId) {
        if let Some(sequence) = self.pages.remove(&page_id) {
            if let Some(old) = self.entries.remove(&sequence) {
                self.total_bytes -= old.length;
            }
        }
    }

    /// Remove oldest entries until the live total fits the quota
    fn evict_over_quota(&mut self) {
        while self.total_bytes > self.quota {
            let Some((_, oldest)) = self.entries.pop_first() else {
                break;
            };
            self.pages.remove(&oldest.page_id);
            self.total_bytes -= oldest.length;

            tracing::trace!(
                session = %self.session_id,
                page_id = oldest.page_id,
                length = oldest.length,
                "Evicted page over quota"
            );
        }
    }
}
