//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer. Row-level data
//! problems are not errors: they are counted and the row is dropped.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// On-disk state could not be opened
    #[error("Cannot open storage at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: Box<StorageError>,
    },

    /// Error while working with a part file
    #[error("Part {path:?}: {source}")]
    Part {
        path: PathBuf,
        #[source]
        source: Box<StorageError>,
    },

    /// Error while working with a partition
    #[error("Partition {name}: {source}")]
    Partition {
        name: String,
        #[source]
        source: Box<StorageError>,
    },

    /// Error inside the inverted index
    #[error("Index error ({context}): {source}")]
    Index {
        context: String,
        #[source]
        source: Box<StorageError>,
    },

    /// Requested item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid time range (start > end)
    #[error("Invalid time range: start must not be greater than end")]
    InvalidTimeRange,

    /// Part file format error
    #[error("Invalid part format: {0}")]
    InvalidPart(String),

    /// WAL format or recovery error
    #[error("WAL error: {0}")]
    WalError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// precision_bits outside 1..=64
    #[error("precision_bits must be in the range [1..64]; got {0}")]
    InvalidPrecisionBits(u8),

    /// Metric name could not be decoded or violates label limits
    #[error("Invalid metric name: {0}")]
    InvalidMetricName(String),

    /// Tag filter could not be compiled
    #[error("Invalid tag filter: {0}")]
    InvalidFilter(String),

    /// A search would return more series than allowed
    #[error("Too many matching series: the limit of {limit} was exceeded; narrow the query")]
    TooManyMatches { limit: usize },

    /// The concurrency limiter rejected the request
    #[error("Too many concurrent requests: {0}")]
    TooManyRequests(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation deadline passed
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),
}

impl StorageError {
    /// Wrap with the path of the part being processed
    pub fn in_part(self, path: impl Into<PathBuf>) -> Self {
        StorageError::Part {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Wrap with the name of the partition being processed
    pub fn in_partition(self, name: impl Into<String>) -> Self {
        StorageError::Partition {
            name: name.into(),
            source: Box::new(self),
        }
    }

    /// Wrap with the index operation being performed
    pub fn in_index(self, context: impl Into<String>) -> Self {
        StorageError::Index {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for errors the caller may retry after backing off
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::TooManyRequests(_))
    }

    /// True for errors the caller can fix by changing the request
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StorageError::TooManyMatches { .. }
                | StorageError::InvalidFilter(_)
                | StorageError::InvalidTimeRange
                | StorageError::InvalidPrecisionBits(_)
                | StorageError::InvalidMetricName(_)
        )
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::TooManyMatches { limit: 10 };
        assert_eq!(
            err.to_string(),
            "Too many matching series: the limit of 10 was exceeded; narrow the query"
        );

        let err = StorageError::InvalidPrecisionBits(0);
        assert_eq!(
            err.to_string(),
            "precision_bits must be in the range [1..64]; got 0"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }

    #[test]
    fn test_context_wrapping() {
        let err = StorageError::Corruption("bad crc".into())
            .in_part("/data/2024_01/0000000000000001.part")
            .in_partition("2024_01");
        let msg = err.to_string();
        assert!(msg.starts_with("Partition 2024_01: Part"));
        assert!(msg.contains("bad crc"));
    }

    #[test]
    fn test_classification() {
        assert!(StorageError::TooManyRequests("x".into()).is_retriable());
        assert!(StorageError::TooManyMatches { limit: 1 }.is_user_error());
        assert!(!StorageError::Cancelled.is_user_error());
    }
}
