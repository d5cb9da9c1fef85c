//! Lazy per-series search over parts and pending rows
//!
//! A search resolves its tag filters to a sorted list of series, takes a
//! [`TableView`] and then decodes one series at a time as the caller
//! pulls from [`SeriesIter`]. Samples of one series are returned in
//! ascending timestamp order; series come in TSID order.

use crate::storage::block::Block;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::merge::deduplicate;
use crate::storage::metric_name::MetricName;
use crate::storage::part::PartHandle;
use crate::storage::table::TableView;
use crate::storage::tsid::Tsid;
use crate::storage::types::{Series, TimeRange};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline and cancellation flag of one request.
///
/// Clones share the flag, so a handler can keep one copy and cancel the
/// search running on another thread.
#[derive(Debug, Clone)]
pub struct SearchContext {
    started: Instant,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Default for SearchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchContext {
    /// No deadline
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started.checked_add(timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails once the request is cancelled or past its deadline
    pub fn check(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::DeadlineExceeded(self.started.elapsed()));
            }
        }
        Ok(())
    }
}

/// Iterator over the samples of the matched series
pub struct SeriesIter {
    series: std::vec::IntoIter<(Tsid, Arc<MetricName>)>,
    parts: Vec<Arc<PartHandle>>,
    pending: HashMap<u64, Vec<(i64, f64)>>,
    range: TimeRange,
    dedup_interval_ms: i64,
    ctx: SearchContext,
    done: bool,
}

impl SeriesIter {
    /// `series` must be sorted by TSID
    pub(crate) fn new(
        series: Vec<(Tsid, Arc<MetricName>)>,
        view: TableView,
        range: TimeRange,
        dedup_interval_ms: i64,
        ctx: SearchContext,
    ) -> Self {
        let mut pending: HashMap<u64, Vec<(i64, f64)>> = HashMap::new();
        for r in view.pending {
            pending
                .entry(r.tsid.metric_id)
                .or_default()
                .push((r.timestamp, r.value));
        }
        Self {
            series: series.into_iter(),
            parts: view.parts,
            pending,
            range,
            dedup_interval_ms,
            ctx,
            done: false,
        }
    }

    /// An iterator that yields nothing
    pub fn empty() -> Self {
        Self::new(
            Vec::new(),
            TableView::default(),
            TimeRange::all(),
            0,
            SearchContext::new(),
        )
    }

    fn read_series(&mut self, tsid: Tsid, mn: &MetricName) -> StorageResult<Option<Series>> {
        let mut timestamps = Vec::new();
        let mut values = Vec::new();
        let mut precision_bits = 1u8;
        for h in &self.parts {
            for idx in h.part.block_indices(&tsid, &self.range) {
                let block = h.part.read_block(idx)?;
                precision_bits = precision_bits.max(block.precision_bits);
                timestamps.extend_from_slice(&block.timestamps);
                values.extend_from_slice(&block.values);
            }
        }
        if let Some(rows) = self.pending.remove(&tsid.metric_id) {
            precision_bits = 64;
            for (ts, v) in rows {
                timestamps.push(ts);
                values.push(v);
            }
        }
        if timestamps.is_empty() {
            return Ok(None);
        }

        let mut block = Block::new(tsid, timestamps, values, precision_bits);
        let range = self.range;
        block.retain_timestamps(|ts| range.contains(ts));
        if self.dedup_interval_ms > 0 {
            deduplicate(&mut block, self.dedup_interval_ms);
        }
        if block.is_empty() {
            return Ok(None);
        }
        Ok(Some(Series {
            tsid,
            metric_name: mn.clone(),
            timestamps: block.timestamps,
            values: block.values,
        }))
    }
}

impl Iterator for SeriesIter {
    type Item = StorageResult<Series>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some((tsid, mn)) = self.series.next() {
            if let Err(e) = self.ctx.check() {
                self.done = true;
                return Some(Err(e));
            }
            match self.read_series(tsid, &mn) {
                Ok(Some(series)) => return Some(Ok(series)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::part::{Part, PartWriter};
    use crate::storage::types::RawRow;
    use tempfile::tempdir;

    fn tsid(id: u64) -> Tsid {
        Tsid {
            metric_id: id,
            ..Tsid::default()
        }
    }

    fn part_with(dir: &std::path::Path, name: &str, id: u64, ts: &[i64]) -> Arc<PartHandle> {
        let path = dir.join(name);
        let mut w = PartWriter::create(&path).unwrap();
        let block = Block::new(tsid(id), ts.to_vec(), ts.iter().map(|t| *t as f64).collect(), 64);
        w.write_block(&block).unwrap();
        let path = w.finish().unwrap().unwrap();
        Arc::new(PartHandle::new(Part::open(path).unwrap()))
    }

    fn named(id: u64) -> (Tsid, Arc<MetricName>) {
        (tsid(id), Arc::new(MetricName::new("cpu", vec![]).tag("id", id.to_string())))
    }

    #[test]
    fn test_merges_parts_and_pending_rows() {
        let dir = tempdir().unwrap();
        let view = TableView {
            parts: vec![
                part_with(dir.path(), "1.part", 1, &[3000, 4000]),
                part_with(dir.path(), "2.part", 1, &[1000, 5000]),
            ],
            pending: vec![RawRow {
                tsid: tsid(1),
                timestamp: 2000,
                value: 2000.0,
                precision_bits: 64,
            }],
        };
        let range = TimeRange::try_new(1000, 4000).unwrap();
        let out: Vec<Series> = SeriesIter::new(vec![named(1), named(2)], view, range, 0, SearchContext::new())
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamps, vec![1000, 2000, 3000, 4000]);
        assert_eq!(out[0].values, vec![1000.0, 2000.0, 3000.0, 4000.0]);
        assert_eq!(out[0].metric_name.label_value("id"), Some("1"));
    }

    #[test]
    fn test_dedup_on_read() {
        let dir = tempdir().unwrap();
        let view = TableView {
            parts: vec![part_with(dir.path(), "1.part", 1, &[1000, 1500, 2000, 2500])],
            pending: vec![],
        };
        let out: Vec<Series> = SeriesIter::new(vec![named(1)], view, TimeRange::all(), 1000, SearchContext::new())
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(out[0].timestamps, vec![1000, 2000, 2500]);
    }

    #[test]
    fn test_cancellation_stops_iteration() {
        let ctx = SearchContext::new();
        let mut it = SeriesIter::new(vec![named(1), named(2)], TableView::default(), TimeRange::all(), 0, ctx.clone());
        ctx.cancel();
        assert!(matches!(it.next(), Some(Err(StorageError::Cancelled))));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_deadline() {
        let ctx = SearchContext::with_timeout(Duration::from_millis(0));
        assert!(matches!(ctx.check(), Err(StorageError::DeadlineExceeded(_))));
        assert!(SearchContext::new().check().is_ok());
    }
}
