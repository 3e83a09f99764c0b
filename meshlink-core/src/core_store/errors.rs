/*
    errors.rs - Error types for the local store

    Covers:
    - SQLite statements and migrations
    - Pool checkout
    - Row encoding (vector clocks, dependency lists)
*/

use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite statement failed
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// No pooled connection available
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row holds a value outside its domain
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Data directory could not be prepared
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock poisoned by a panicking writer
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
