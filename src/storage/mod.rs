//! Strata Storage Engine
//!
//! This module provides the core time-series storage functionality:
//!
//! - **types**: Core data structures (MetricRow, RawRow, TimeRange, Series)
//! - **metric_name**: Canonical label sets and their limits
//! - **tsid**: Series identifiers and their sort order
//! - **block**: Up to 8192 samples of one series
//! - **part**: Immutable on-disk sorted runs of blocks
//! - **merge**: K-way block merge with deduplication and deleted-series filtering
//! - **partition**: One calendar month of parts plus its merge policy
//! - **table**: Pending row shards, partitions, flusher and merge workers
//! - **wal**: Write-ahead log for rows not yet in parts
//! - **search**: Lazy per-series iteration with deadlines
//! - **snapshot**: Hard-link snapshots of parts and the index
//! - **engine**: The storage handle tying the index and the table together
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   MetricRow → TSID (cache → indexDB) → WAL → pending shard → part (month partition)
//!
//! Read Path:
//!   Tag filters → indexDB → metric IDs → parts + pending rows → Series
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use strata::index::TagFilter;
//! use strata::storage::{MetricRow, SearchContext, StorageConfig, StorageEngine, TimeRange};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::open(StorageConfig::new("./data"))?;
//!
//!     let row = MetricRow::from_labels(&[("__name__", "cpu"), ("host", "a")], 1_700_000_000_000, 0.5);
//!     engine.add_rows(&[row], 64)?;
//!
//!     let filters = [TagFilter::metric("cpu")];
//!     for series in engine.search(&filters, &TimeRange::last_hours(24), SearchContext::new())? {
//!         let series = series?;
//!         println!("{}: {} samples", series.metric_name, series.len());
//!     }
//!
//!     engine.must_close()?;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod engine;
pub mod error;
pub mod merge;
pub mod metric_name;
pub mod part;
pub mod partition;
pub mod search;
pub mod snapshot;
pub mod table;
pub mod tsid;
pub mod types;
pub mod wal;

// Re-export commonly used types
pub use engine::{IngestStats, SearchLimits, StorageConfig, StorageEngine, StorageStats};
pub use error::{StorageError, StorageResult};
pub use metric_name::{LabelLimits, MetricName, Tag};
pub use search::{SearchContext, SeriesIter};
pub use table::{TableConfig, TableStats};
pub use tsid::Tsid;
pub use types::{MetricRow, RawRow, Series, TimeRange};
pub use wal::{WalSyncMode, WriteAheadLog};
