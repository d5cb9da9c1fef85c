//! # Strata
//!
//! An embeddable time-series storage engine: samples of labeled series
//! go into monthly partitions of immutable, merged parts, and an inverted
//! label index answers selector queries.
//!
//! ## Features
//!
//! - **Compact storage**: per-column delta/XOR encoding with optional LZ4,
//!   values rounded to a configurable precision
//! - **Label index**: tag filters (`=`, `!=`, `=~`, `!~`) resolved through
//!   postings lists, narrowed by a per-day index
//! - **Background merges**: small and big merge workers keep the part
//!   count bounded; ingestion helps out when they fall behind
//! - **Durability**: write-ahead log for rows not yet in parts, atomic
//!   part lists, hard-link snapshots
//! - **Retention and deletion**: whole months dropped past retention,
//!   deleted series filtered on read and removed on merge
//!
//! ## Modules
//!
//! - [`storage`]: Storage engine, parts, partitions, merges
//! - [`index`]: Inverted label index (indexDB)
//! - [`encoding`]: Column codecs
//! - [`cache`]: Caches and the memory budget
//! - [`concurrency`]: Limiters, worker pools, wait groups
//! - [`query`]: Series selector parser
//! - [`ingest`]: JSON lines and CSV import/export
//! - [`api`]: HTTP API with Axum
//! - [`config`]: TOML configuration and logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::index::TagFilter;
//! use strata::storage::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::open(StorageConfig::new("./data"))?;
//!
//!     let now = chrono::Utc::now().timestamp_millis();
//!     let rows: Vec<MetricRow> = (0..60)
//!         .map(|i| MetricRow::from_labels(&[("__name__", "temperature"), ("room", "kitchen")], now - i * 60_000, 21.5))
//!         .collect();
//!     let stats = engine.add_rows(&rows, 64)?;
//!     println!("Added {} rows", stats.rows_added);
//!
//!     let filters = [TagFilter::metric("temperature")];
//!     for series in engine.search(&filters, &TimeRange::last_hours(2), SearchContext::new())? {
//!         let series = series?;
//!         println!("{}: {} samples", series.metric_name, series.len());
//!     }
//!
//!     // Graceful shutdown
//!     engine.must_close()?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod encoding;
pub mod index;
pub mod ingest;
pub mod query;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    MetricName, MetricRow, SearchContext, Series, StorageConfig, StorageEngine, StorageError,
    StorageResult, StorageStats, TimeRange, Tsid,
};

pub use index::{IndexDb, IndexStats, TagFilter};

pub use query::{parse_selector, QueryError};

pub use ingest::{ImportError, ImportFormat, ImportStats, Importer, ImporterConfig};

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use config::{
    ApiConfig as ConfigApiConfig, Config, ConfigError, LoggingConfig, SearchConfig,
    StorageConfig as ConfigStorageConfig,
};
