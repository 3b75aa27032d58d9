//! Error types for pagestore
//!
//! Provides a unified error type for all store operations.
//! A missing page is not an error: lookups return `Ok(None)`.

use thiserror::Error;

use crate::store::PageId;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for pagestore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    #[error("Checksum mismatch for page {page_id} of session {session_id:?}")]
    Corruption { session_id: String, page_id: PageId },

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Store has been destroyed")]
    Destroyed,

    // -------------------------------------------------------------------------
    // Backpressure Errors
    // -------------------------------------------------------------------------
    #[error("Write queue is full")]
    Busy,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
