//! Aggregation error types

use thiserror::Error;

/// Aggregation errors
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Invalid aggregate definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),
}

/// Result type for aggregation operations
pub type Result<T> = std::result::Result<T, AggregationError>;
