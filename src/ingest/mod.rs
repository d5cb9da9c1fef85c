//! Strata Import/Export
//!
//! Decoders that turn text into [`MetricRow`](crate::storage::MetricRow)s
//! and the [`Importer`] that fans decoded batches out to insert workers:
//!
//! - **jsonl**: one series per JSON line, also the export format
//! - **csv**: `selector,timestamp,value` records
//! - **importer**: bounded queue plus a fixed insert-worker pool
//!
//! Malformed lines are counted and skipped; only storage failures abort
//! an import.

pub mod csv;
pub mod importer;
pub mod jsonl;

pub use importer::{ImportStats, Importer, ImporterConfig};

use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input formats understood by the importer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    JsonLines,
    Csv,
}

impl std::str::FromStr for ImportFormat {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json" | "json_lines" => Ok(ImportFormat::JsonLines),
            "csv" => Ok(ImportFormat::Csv),
            other => Err(ImportError::UnknownFormat(other.to_string())),
        }
    }
}

/// Errors that can occur while importing or exporting
#[derive(Error, Debug)]
pub enum ImportError {
    /// A line or record could not be decoded
    #[error("line {line}: {message}")]
    Parse { line: u64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unknown import format: {0}")]
    UnknownFormat(String),

    /// The insert workers are gone
    #[error("Importer is shut down")]
    Closed,
}

/// Result type for import operations
pub type ImportResult<T> = Result<T, ImportError>;
