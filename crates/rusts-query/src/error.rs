//! Query error types

use rusts_core::ShardId;
use thiserror::Error;

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("No shards: {0}")]
    NoShards(String),

    #[error("Shards not found: {0:?}")]
    ShardNotFound(Vec<ShardId>),

    #[error("Index error: {0}")]
    Index(#[from] rusts_index::IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusts_storage::StorageError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] rusts_aggregation::AggregationError),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    #[error("No send stream for receiver: {0}")]
    NoSendStream(String),

    #[error("Task panicked: {0}")]
    TaskPanic(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueryError {
    /// Whether the error only says that there is no data
    pub fn is_not_found(&self) -> bool {
        match self {
            QueryError::Index(err) => err.is_not_found(),
            QueryError::Storage(err) => err.is_not_found(),
            _ => false,
        }
    }
}

/// Result type for query operations
pub type Result<T> = std::result::Result<T, QueryError>;

impl From<bincode::Error> for QueryError {
    fn from(e: bincode::Error) -> Self {
        QueryError::Serialization(e.to_string())
    }
}

impl From<rusts_core::CoreError> for QueryError {
    fn from(e: rusts_core::CoreError) -> Self {
        QueryError::InvalidQuery(e.to_string())
    }
}
