//! Configuration for pagestore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Main configuration for a page store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory under which the application's store folder lives
    /// Internal structure:
    ///   {root_dir}/
    ///     └── {application_name}-filestore/
    ///           └── {encoded session id}/
    ///                 └── data
    pub root_dir: PathBuf,

    /// Namespaces the store folder so several applications can share a root
    pub application_name: String,

    /// Per-session byte quota; oldest pages are evicted beyond it
    pub max_size_per_session: u64,

    /// Nominal bound on concurrently open file handles
    pub file_channel_pool_capacity: usize,

    /// Delete leftover session files from a previous process on open.
    /// The page index lives only in memory, so such files are unreadable.
    pub purge_on_open: bool,

    // -------------------------------------------------------------------------
    // Write-Behind Configuration
    // -------------------------------------------------------------------------
    /// Settings for `AsynchronousDataStore`
    pub async_config: AsyncConfig,
}

/// Write-behind layer settings
#[derive(Debug, Clone)]
pub struct AsyncConfig {
    /// Total number of writes that may wait in the queue
    pub queue_capacity: usize,

    /// Number of background flush workers
    pub worker_count: usize,

    /// What `store_data` does when the queue is full
    pub queue_full_policy: QueueFullPolicy,

    /// What happens to queued writes on `destroy`
    pub shutdown_policy: ShutdownPolicy,
}

/// Behavior of an asynchronous `store_data` when its queue shard is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Wait until a worker frees a slot
    Block,

    /// Fail immediately with `StoreError::Busy`
    Reject,

    /// Wait up to the given duration, then fail with `StoreError::Busy`
    BlockFor(Duration),
}

/// Fate of queued writes when the asynchronous store is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Flush every queued write into the wrapped store before destroying it
    Flush,

    /// Drop queued writes without storing them
    Discard,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("pagestore"),
            application_name: "default".to_string(),
            max_size_per_session: 10 * 1024 * 1024, // 10 MB
            file_channel_pool_capacity: 50,
            purge_on_open: true,
            async_config: AsyncConfig::default(),
        }
    }
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            worker_count: 1,
            queue_full_policy: QueueFullPolicy::Block,
            shutdown_policy: ShutdownPolicy::Flush,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory holding every session folder of this application
    pub fn store_dir(&self) -> PathBuf {
        self.root_dir
            .join(format!("{}-filestore", self.application_name))
    }

    /// Check the configuration before a store is opened
    pub fn validate(&self) -> Result<()> {
        if self.application_name.is_empty() {
            return Err(StoreError::Config(
                "application_name must not be empty".to_string(),
            ));
        }
        if !self
            .application_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
            || self.application_name.starts_with('.')
        {
            return Err(StoreError::Config(format!(
                "application_name {:?} is not filesystem safe",
                self.application_name
            )));
        }
        if self.max_size_per_session == 0 {
            return Err(StoreError::Config(
                "max_size_per_session must be positive".to_string(),
            ));
        }
        if self.file_channel_pool_capacity == 0 {
            return Err(StoreError::Config(
                "file_channel_pool_capacity must be positive".to_string(),
            ));
        }
        if self.async_config.queue_capacity == 0 {
            return Err(StoreError::Config(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.async_config.worker_count == 0 {
            return Err(StoreError::Config(
                "worker_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the root directory
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_dir = path.into();
        self
    }

    /// Set the application name (store folder namespace)
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Set the per-session quota (in bytes)
    pub fn max_size_per_session(mut self, bytes: u64) -> Self {
        self.config.max_size_per_session = bytes;
        self
    }

    /// Set the file handle pool capacity
    pub fn file_channel_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.file_channel_pool_capacity = capacity;
        self
    }

    /// Whether to delete leftover session files on open
    pub fn purge_on_open(mut self, purge: bool) -> Self {
        self.config.purge_on_open = purge;
        self
    }

    /// Set the write-behind queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.async_config.queue_capacity = capacity;
        self
    }

    /// Set the number of write-behind workers
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.async_config.worker_count = count;
        self
    }

    /// Set the queue-full behavior
    pub fn queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.config.async_config.queue_full_policy = policy;
        self
    }

    /// Set the shutdown behavior for queued writes
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.config.async_config.shutdown_policy = policy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
