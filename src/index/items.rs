//! Records of the index item log
//!
//! The in-memory index is rebuilt by applying these items in log order.
//! Applying an item twice has no further effect, so a compacted snapshot
//! may overlap with segments written after it.

use crate::storage::tsid::Tsid;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexItem {
    /// A new series with every entry derived from it: name → TSID,
    /// metric ID → name, metric ID → TSID and label → metric ID
    Series {
        metric_id: u64,
        tsid: Tsid,
        /// Canonical marshaled `MetricName`
        metric_name: Vec<u8>,
    },
    /// The series has samples on `date` (days since the epoch)
    Date { date: u64, metric_id: u64 },
    /// All series with samples on `date`, as a serialized roaring set.
    /// Written by compaction only.
    DateSet { date: u64, metric_ids: Vec<u8> },
    /// Tombstones
    Deleted { metric_ids: Vec<u64> },
}
