//! Query error types
//!
//! Errors raised while turning request text into tag filters and time ranges.

use thiserror::Error;

/// Errors that can occur while parsing selectors and time expressions
#[derive(Error, Debug)]
pub enum QueryError {
    /// Selector or duration parsing failed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid time or time range specified
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    /// Selector is well-formed but not usable
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
