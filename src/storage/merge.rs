//! K-way merge of parts and flushing of raw rows
//!
//! Both paths produce blocks in (TSID, timestamp) order for a
//! [`PartWriter`]. During a merge, all blocks of one TSID across the input
//! parts are combined, sorted by timestamp and filtered:
//! - rows of deleted metric IDs are dropped
//! - rows older than the retention deadline are dropped
//! - with a dedup interval, one sample per interval is kept

use crate::storage::block::Block;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::part::{PartHandle, PartWriter};
use crate::storage::tsid::Tsid;
use crate::storage::types::RawRow;
use roaring::RoaringTreemap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a merge is allowed to drop
#[derive(Debug, Clone)]
pub struct MergeFilter {
    pub deleted_metric_ids: Arc<RoaringTreemap>,
    /// Rows with smaller timestamps are outside the retention
    pub min_timestamp: i64,
    /// 0 disables deduplication
    pub dedup_interval_ms: i64,
}

impl MergeFilter {
    /// Keep everything
    pub fn none() -> Self {
        Self {
            deleted_metric_ids: Arc::new(RoaringTreemap::new()),
            min_timestamp: i64::MIN,
            dedup_interval_ms: 0,
        }
    }
}

/// Counters of one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub rows_expired: u64,
    pub rows_deduplicated: u64,
}

/// Merge `parts` into `writer`. Checks `stop` between series.
pub fn merge_parts(
    parts: &[Arc<PartHandle>],
    writer: &mut PartWriter,
    filter: &MergeFilter,
    stop: &AtomicBool,
) -> StorageResult<MergeStats> {
    let mut stats = MergeStats::default();
    // (tsid, part index, block index) cursors, smallest TSID first
    let mut heap: BinaryHeap<Reverse<(Tsid, usize, usize)>> = BinaryHeap::new();
    for (pi, p) in parts.iter().enumerate() {
        if let Some(bh) = p.part.blocks.first() {
            heap.push(Reverse((bh.tsid, pi, 0)));
        }
    }

    while let Some(Reverse((tsid, _, _))) = heap.peek().copied() {
        if stop.load(Ordering::Relaxed) {
            return Err(StorageError::Cancelled);
        }
        let mut timestamps = Vec::new();
        let mut values = Vec::new();
        let mut precision_bits = 1u8;

        while let Some(Reverse((t, pi, bi))) = heap.peek().copied() {
            if t != tsid {
                break;
            }
            heap.pop();
            let part = &parts[pi].part;
            let mut idx = bi;
            while idx < part.blocks.len() && part.blocks[idx].tsid == tsid {
                let block = part.read_block(idx)?;
                stats.rows_read += block.rows_count() as u64;
                precision_bits = precision_bits.max(block.precision_bits);
                timestamps.extend_from_slice(&block.timestamps);
                values.extend_from_slice(&block.values);
                idx += 1;
            }
            if let Some(next) = part.blocks.get(idx) {
                heap.push(Reverse((next.tsid, pi, idx)));
            }
        }

        if filter.deleted_metric_ids.contains(tsid.metric_id) {
            stats.rows_deleted += timestamps.len() as u64;
            continue;
        }
        let mut block = Block::new(tsid, timestamps, values, precision_bits);
        let before = block.rows_count();
        block.retain_timestamps(|ts| ts >= filter.min_timestamp);
        stats.rows_expired += (before - block.rows_count()) as u64;
        if filter.dedup_interval_ms > 0 {
            let before = block.rows_count();
            deduplicate(&mut block, filter.dedup_interval_ms);
            stats.rows_deduplicated += (before - block.rows_count()) as u64;
        }
        stats.rows_written += block.rows_count() as u64;
        writer.write_block(&block)?;
    }
    Ok(stats)
}

/// Write buffered rows as blocks; `rows` is sorted in place
pub fn write_raw_rows(rows: &mut [RawRow], writer: &mut PartWriter) -> StorageResult<u64> {
    rows.sort_unstable_by(|a, b| {
        a.tsid
            .cmp(&b.tsid)
            .then(a.timestamp.cmp(&b.timestamp))
    });
    let mut written = 0u64;
    for group in rows.chunk_by(|a, b| a.tsid == b.tsid) {
        let precision_bits = group.iter().map(|r| r.precision_bits).max().unwrap_or(64);
        let block = Block {
            tsid: group[0].tsid,
            timestamps: group.iter().map(|r| r.timestamp).collect(),
            values: group.iter().map(|r| r.value).collect(),
            precision_bits,
        };
        writer.write_block(&block)?;
        written += group.len() as u64;
    }
    Ok(written)
}

/// Keep the last sample of every `interval_ms` window `(k*i - i, k*i]`;
/// equal timestamps keep the largest value
pub fn deduplicate(block: &mut Block, interval_ms: i64) {
    if interval_ms <= 0 || block.rows_count() < 2 {
        return;
    }
    let window = |ts: i64| {
        let q = ts.div_euclid(interval_ms);
        if ts.rem_euclid(interval_ms) == 0 {
            q
        } else {
            q + 1
        }
    };
    let n = block.rows_count();
    let mut j = 0;
    for i in 0..n {
        let ts = block.timestamps[i];
        let v = block.values[i];
        let is_last_in_window = i + 1 == n || window(block.timestamps[i + 1]) != window(ts);
        if !is_last_in_window {
            continue;
        }
        let mut best = v;
        let mut k = i;
        while k > 0 && block.timestamps[k - 1] == ts {
            k -= 1;
            if block.values[k] > best {
                best = block.values[k];
            }
        }
        block.timestamps[j] = ts;
        block.values[j] = best;
        j += 1;
    }
    block.timestamps.truncate(j);
    block.values.truncate(j);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::part::Part;
    use std::path::Path;
    use tempfile::tempdir;

    fn tsid(id: u64) -> Tsid {
        Tsid {
            metric_group_id: id / 10,
            job_id: 0,
            instance_id: 0,
            metric_id: id,
        }
    }

    fn row(id: u64, ts: i64, v: f64) -> RawRow {
        RawRow {
            tsid: tsid(id),
            timestamp: ts,
            value: v,
            precision_bits: 64,
        }
    }

    fn flush(dir: &Path, name: &str, mut rows: Vec<RawRow>) -> Arc<PartHandle> {
        let mut w = PartWriter::create(dir.join(name)).unwrap();
        write_raw_rows(&mut rows, &mut w).unwrap();
        let path = w.finish().unwrap().unwrap();
        Arc::new(PartHandle::new(Part::open(path).unwrap()))
    }

    fn triples(p: &Part) -> Vec<(Tsid, i64, f64)> {
        let mut out = Vec::new();
        for i in 0..p.blocks.len() {
            let b = p.read_block(i).unwrap();
            for (t, v) in b.timestamps.iter().zip(&b.values) {
                out.push((b.tsid, *t, *v));
            }
        }
        out
    }

    #[test]
    fn test_merge_preserves_content() {
        let dir = tempdir().unwrap();
        let a = flush(dir.path(), "a.part", vec![row(1, 30, 3.0), row(2, 10, 1.5), row(1, 10, 1.0)]);
        let b = flush(dir.path(), "b.part", vec![row(1, 20, 2.0), row(3, 5, 9.0)]);
        let c = flush(dir.path(), "c.part", vec![row(2, 5, 0.5), row(13, 1, 7.0)]);

        let mut expected: Vec<(Tsid, i64, f64)> = [&a, &b, &c]
            .iter()
            .flat_map(|p| triples(&p.part))
            .collect();
        expected.sort_by(|x, y| x.0.cmp(&y.0).then(x.1.cmp(&y.1)));

        let mut w = PartWriter::create(dir.path().join("m.part")).unwrap();
        let stop = AtomicBool::new(false);
        let stats = merge_parts(&[a, b, c], &mut w, &MergeFilter::none(), &stop).unwrap();
        let merged = Part::open(w.finish().unwrap().unwrap()).unwrap();

        assert_eq!(stats.rows_read, 7);
        assert_eq!(stats.rows_written, 7);
        assert_eq!(triples(&merged), expected);
    }

    #[test]
    fn test_merge_drops_deleted_and_expired() {
        let dir = tempdir().unwrap();
        let a = flush(dir.path(), "a.part", vec![row(1, 10, 1.0), row(1, 100, 2.0), row(2, 100, 3.0)]);
        let mut deleted = RoaringTreemap::new();
        deleted.insert(2);
        let filter = MergeFilter {
            deleted_metric_ids: Arc::new(deleted),
            min_timestamp: 50,
            dedup_interval_ms: 0,
        };
        let mut w = PartWriter::create(dir.path().join("m.part")).unwrap();
        let stats = merge_parts(&[a], &mut w, &filter, &AtomicBool::new(false)).unwrap();
        let merged = Part::open(w.finish().unwrap().unwrap()).unwrap();
        assert_eq!(stats.rows_deleted, 1);
        assert_eq!(stats.rows_expired, 1);
        assert_eq!(triples(&merged), vec![(tsid(1), 100, 2.0)]);
    }

    #[test]
    fn test_merge_stops() {
        let dir = tempdir().unwrap();
        let a = flush(dir.path(), "a.part", vec![row(1, 10, 1.0)]);
        let mut w = PartWriter::create(dir.path().join("m.part")).unwrap();
        let res = merge_parts(&[a], &mut w, &MergeFilter::none(), &AtomicBool::new(true));
        assert!(matches!(res, Err(StorageError::Cancelled)));
    }

    #[test]
    fn test_deduplicate() {
        let mut b = Block::new(
            tsid(1),
            vec![1, 5, 10, 10, 11, 19, 25],
            vec![1.0, 2.0, 4.0, 3.0, 5.0, 6.0, 7.0],
            64,
        );
        deduplicate(&mut b, 10);
        assert_eq!(b.timestamps, vec![10, 19, 25]);
        assert_eq!(b.values, vec![4.0, 6.0, 7.0]);
    }
}
