//! Strata Index Structures
//!
//! The inverted index (indexDB) maps label sets to series:
//!
//! - **MetricIndex**: canonical name → TSID, metric ID → name and TSID
//! - **TagIndex**: label pair → metric IDs
//! - **DateIndex**: day → metric IDs with samples that day
//! - **ItemLog**: durable log the structures above are rebuilt from
//!
//! # Architecture
//!
//! ```text
//! Ingest: cpu{host="a"} ──► get_or_create_tsid ──► item log (fsync policy)
//!                                                  └► memory, under the log lock
//!
//! Search: TagFilters + TimeRange ──► DateIndex universe
//!                                 ──► TagIndex postings, smallest first
//!                                 ──► MetricIndex names for costly filters
//! ```

mod db;
mod filters;
mod item_log;
mod items;
mod metric_index;
mod tag_index;
mod time_index;

pub use db::{CompactionStats, IndexConfig, IndexDb, IndexStats, TagEntry, Truncated};
pub use filters::TagFilter;
pub use items::IndexItem;
pub use metric_index::MetricIndex;
pub use tag_index::TagIndex;
pub use time_index::DateIndex;
