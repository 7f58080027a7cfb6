//! Storage error types

use rusts_core::ShardId;
use rusts_index::IndexError;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("Family not found: {0}")]
    FamilyNotFound(String),

    #[error("Metric not found in family: {0}")]
    MetricNotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

impl StorageError {
    /// Whether the error only says that there is no data
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ShardNotFound(_)
            | StorageError::FamilyNotFound(_)
            | StorageError::MetricNotFound(_) => true,
            StorageError::Index(err) => err.is_not_found(),
            StorageError::InvalidData(_) => false,
        }
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
