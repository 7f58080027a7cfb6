//! Index error types

use thiserror::Error;

/// Index errors
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Metric not found: {0}")]
    MetricNotFound(String),

    #[error("Tag key not found: {0}")]
    TagKeyNotFound(String),

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    #[error("Invalid tag filter: {0}")]
    InvalidFilter(String),

    #[error("Tag filter result missing for condition: {0}")]
    FilterResultMissing(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl IndexError {
    /// Whether the error only says that nothing matched
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IndexError::MetricNotFound(_)
                | IndexError::TagKeyNotFound(_)
                | IndexError::FieldNotFound(_)
                | IndexError::SeriesNotFound(_)
        )
    }
}

/// Result type for index operations
pub type Result<T> = std::result::Result<T, IndexError>;
