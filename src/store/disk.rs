//! Disk Data Store
//!
//! Synchronous store routing each session to its own `SessionStore`.
//!
//! ## Responsibilities
//! - Create session stores lazily on first write
//! - Serialize operations per session, run different sessions in parallel
//! - Own the shared `FileChannelPool`
//! - Delete session files on removal and on destroy

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::pool::FileChannelPool;
use crate::session::{SessionStore, SessionUsage};

use super::{DataStore, PageId};

/// The synchronous disk-backed page store
///
/// ## Concurrency Model: per-session locking
///
/// - `sessions`: RwLock over the map only; held just long enough to look up
///   or insert an `Arc<Mutex<SessionStore>>`, never across disk I/O
/// - Each `SessionStore` has its own mutex. Appends, reads and removal of
///   one session serialize on it; other sessions are unaffected
/// - `destroyed`: every operation holds it shared for its whole duration,
///   `destroy` takes it exclusively, so destroy waits for in-flight calls
///   and nothing runs after it
/// - A removed session leaves the map only after its files are gone, so a
///   new store for the same id never shares a directory with a dying one
///
/// Lock order: `destroyed` → session mutex → `sessions` → pool.
/// `sessions` is never held while waiting for a session mutex.
pub struct DiskDataStore {
    /// Store configuration
    config: Config,

    /// `{root_dir}/{application_name}-filestore`
    store_dir: PathBuf,

    /// Open file handles shared by all sessions
    pool: Arc<FileChannelPool>,

    /// session id → session store
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionStore>>>>,

    /// Lifecycle gate (true once destroyed)
    destroyed: RwLock<bool>,
}

impl DiskDataStore {
    /// Open a store with the given config
    ///
    /// On open:
    /// 1. Validate the config
    /// 2. Purge leftovers of a previous process if `purge_on_open` is set
    ///
    /// Directories are created lazily by the first write of each session.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store_dir = config.store_dir();

        if config.purge_on_open {
            match fs::remove_dir_all(&store_dir) {
                Ok(()) => {
                    tracing::info!(dir = %store_dir.display(), "Purged stale page store");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let pool = Arc::new(FileChannelPool::new(config.file_channel_pool_capacity));

        tracing::debug!(
            dir = %store_dir.display(),
            max_size_per_session = config.max_size_per_session,
            pool_capacity = config.file_channel_pool_capacity,
            "Opened disk data store"
        );

        Ok(Self {
            config,
            store_dir,
            pool,
            sessions: RwLock::new(HashMap::new()),
            destroyed: RwLock::new(false),
        })
    }

    /// Open with a root directory (convenience method)
    ///
    /// Uses default config with the specified root directory
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().root_dir(path).build();
        Self::open(config)
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Number of sessions with a live store
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Disk usage of a session, `None` if it has no store
    pub fn session_usage(&self, session_id: &str) -> Option<SessionUsage> {
        let session = self.session(session_id)?;
        let store = session.lock();
        Some(store.usage())
    }

    /// Live page ids of a session, oldest write first
    pub fn page_ids(&self, session_id: &str) -> Vec<PageId> {
        match self.session(session_id) {
            Some(session) => session.lock().page_ids(),
            None => Vec::new(),
        }
    }

    /// Directory of a session's files (may not exist yet)
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.store_dir
            .join(crate::session::encode_session_id(session_id))
    }

    /// Number of currently open file handles
    pub fn open_channels(&self) -> usize {
        self.pool.open_count()
    }

    /// The shared handle pool
    pub fn pool(&self) -> &FileChannelPool {
        &self.pool
    }

    /// Application store directory
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.read()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn session(&self, session_id: &str) -> Option<Arc<Mutex<SessionStore>>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Drop a map entry if it still points at `session`
    fn forget(&self, session_id: &str, session: &Arc<Mutex<SessionStore>>) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session_id);
        }
    }

    fn session_or_create(&self, session_id: &str) -> Arc<Mutex<SessionStore>> {
        if let Some(session) = self.session(session_id) {
            return session;
        }

        let mut sessions = self.sessions.write();
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| {
            tracing::debug!(session = %session_id, "Creating session store");
            Arc::new(Mutex::new(SessionStore::new(
                session_id,
                &self.store_dir,
                Arc::clone(&self.pool),
                self.config.max_size_per_session,
            )))
        });
        Arc::clone(session)
    }
}

impl DataStore for DiskDataStore {
    fn store_data(&self, session_id: &str, page_id: PageId, data: Bytes) -> Result<()> {
        let destroyed = self.destroyed.read();
        if *destroyed {
            return Err(StoreError::Destroyed);
        }

        loop {
            let session = self.session_or_create(session_id);
            let mut store = session.lock();

            // Lost a race with remove_data; make room for a fresh store
            if store.is_removed() {
                self.forget(session_id, &session);
                continue;
            }

            return store.append(page_id, &data);
        }
    }

    fn get_data(&self, session_id: &str, page_id: PageId) -> Result<Option<Bytes>> {
        let destroyed = self.destroyed.read();
        if *destroyed {
            return Err(StoreError::Destroyed);
        }

        let Some(session) = self.session(session_id) else {
            return Ok(None);
        };

        let store = session.lock();
        if store.is_removed() {
            return Ok(None);
        }
        store.read(page_id)
    }

    fn remove_data(&self, session_id: &str) -> Result<()> {
        let destroyed = self.destroyed.read();
        if *destroyed {
            return Err(StoreError::Destroyed);
        }

        let Some(session) = self.session(session_id) else {
            return Ok(());
        };

        let mut store = session.lock();
        let result = if store.is_removed() {
            Ok(())
        } else {
            store.remove()
        };
        self.forget(session_id, &session);

        result
    }

    fn destroy(&self) -> Result<()> {
        // Waits for every in-flight operation to release its shared guard
        let mut destroyed = self.destroyed.write();
        if *destroyed {
            return Ok(());
        }
        *destroyed = true;

        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        let session_count = sessions.len();

        let mut first_error = None;
        for session in sessions {
            let mut store = session.lock();
            if let Err(e) = store.remove() {
                tracing::warn!(session = %store.session_id(), "Failed to remove session: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.pool.destroy();

        match fs::remove_dir_all(&self.store_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(dir = %self.store_dir.display(), "Failed to remove store directory: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        tracing::info!(sessions = session_count, "Disk data store destroyed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
