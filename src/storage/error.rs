//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageId;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Entry too large: requires {required} bytes but a page holds at most {max}")]
    EntryTooLarge { required: usize, max: usize },

    #[error("Buffer pool exhausted: all {capacity} frames stayed pinned")]
    BufferPoolExhausted { capacity: usize },

    #[error("Page {0} does not exist")]
    PageNotFound(PageId),

    #[error("Corrupted data file: {0}")]
    Corrupted(String),

    #[error("WAL sequence mismatch: expected {expected}, got {actual}")]
    WalMismatch { expected: u64, actual: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
