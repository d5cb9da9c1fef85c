//! Time series identifiers
//!
//! A `Tsid` orders series so that all series of one metric group are
//! adjacent, then series of the same job and instance. Parts store blocks
//! sorted by TSID, so a scan over one metric reads a contiguous range.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::metric_name::MetricName;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Marshaled size in bytes
pub const TSID_SIZE: usize = 24;

/// Sortable surrogate key of one series
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tsid {
    /// Hash of the metric group
    pub metric_group_id: u64,
    /// Hash of the first tag value, usually the job
    pub job_id: u32,
    /// Hash of the second tag value, usually the instance
    pub instance_id: u32,
    /// Unique id of the label set
    pub metric_id: u64,
}

impl Tsid {
    /// Derive the TSID for a newly registered series
    pub fn generate(mn: &MetricName, metric_id: u64) -> Self {
        let metric_group_id = xxh64(mn.metric_group.as_bytes(), 0);
        let job_id = mn
            .tags
            .first()
            .map(|t| xxh64(t.value.as_bytes(), 0) as u32)
            .unwrap_or(0);
        let instance_id = mn
            .tags
            .get(1)
            .map(|t| xxh64(t.value.as_bytes(), 0) as u32)
            .unwrap_or(0);
        Self {
            metric_group_id,
            job_id,
            instance_id,
            metric_id,
        }
    }

    /// Big-endian bytes, preserving `Ord`
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.metric_group_id.to_be_bytes());
        dst.extend_from_slice(&self.job_id.to_be_bytes());
        dst.extend_from_slice(&self.instance_id.to_be_bytes());
        dst.extend_from_slice(&self.metric_id.to_be_bytes());
    }

    pub fn unmarshal(src: &[u8]) -> StorageResult<Self> {
        if src.len() < TSID_SIZE {
            return Err(StorageError::Corruption(format!(
                "TSID needs {} bytes, got {}",
                TSID_SIZE,
                src.len()
            )));
        }
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&src[i..i + 8]);
            u64::from_be_bytes(b)
        };
        let u32_at = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&src[i..i + 4]);
            u32::from_be_bytes(b)
        };
        Ok(Self {
            metric_group_id: u64_at(0),
            job_id: u32_at(8),
            instance_id: u32_at(12),
            metric_id: u64_at(16),
        })
    }
}
