//! indexDB - the inverted index of all series
//!
//! Owns the durable item log and the in-memory structures rebuilt from it:
//!
//! - **MetricIndex**: name → TSID, metric ID → name / TSID
//! - **TagIndex**: label pair → metric IDs
//! - **DateIndex**: day → metric IDs with samples that day
//! - tombstones of deleted series
//!
//! # Search
//!
//! ```text
//! filters: cpu{host=~"web-.*", dc!="eu"}   range: last 2 days
//!        ↓
//! universe: DateIndex days of the range (or every series) - tombstones
//!        ↓
//! positive filters, smallest first:  universe ∩ {cpu} ∩ {web-*}
//!        ↓
//! negative filters:                  ... - {dc=eu}
//!        ↓
//! filters too costly to materialise are checked on metric names
//! ```
//!
//! Every new series is written to the log as one item carrying all of its
//! entries, and applied to memory under the log lock, so a metric ID is
//! never visible without its name, TSID and label entries.

use crate::cache::{BoundedCache, CacheStats, EntrySize};
use crate::index::filters::{CompiledFilter, TagFilter};
use crate::index::item_log::{write_snapshot, ItemLog};
use crate::index::items::IndexItem;
use crate::index::metric_index::MetricIndex;
use crate::index::tag_index::TagIndex;
use crate::index::time_index::DateIndex;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::metric_name::MetricName;
use crate::storage::tsid::Tsid;
use crate::storage::types::TimeRange;
use crate::storage::wal::WalSyncMode;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use roaring::RoaringTreemap;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

/// Stripes of the series creation lock
const CREATE_LOCK_STRIPES: usize = 64;

impl EntrySize for Arc<RoaringTreemap> {
    fn entry_size(&self) -> usize {
        self.serialized_size()
    }
}

/// Configuration for the index
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub sync_mode: WalSyncMode,
    /// Ranges spanning at most this many days start from the per-day index
    pub max_days_for_date_search: u64,
    /// Rotate the active log segment beyond this size
    pub max_segment_bytes: u64,
    /// Compact once this many sealed segments exist
    pub compact_after_segments: usize,
    /// Regex filters are checked on metric names when the candidate set
    /// is at most this large
    pub verify_regex_max_candidates: u64,
    /// Exact filters whose postings exceed the candidate set this many
    /// times are checked on metric names
    pub verify_postings_ratio: u64,
    /// Bytes for the tag-filters result cache
    pub filters_cache_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            sync_mode: WalSyncMode::Batched,
            max_days_for_date_search: 40,
            max_segment_bytes: 16 * 1024 * 1024,
            compact_after_segments: 4,
            verify_regex_max_candidates: 5_000,
            verify_postings_ratio: 10,
            filters_cache_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Label name with its values, as returned by [`IndexDb::search_tag_entries`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagEntry {
    pub key: String,
    pub values: Vec<String>,
}

/// Values of a bounded enumeration plus whether the limit cut it short
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Truncated<T> {
    pub items: Vec<T>,
    pub truncated: bool,
}

/// Statistics about index contents and usage
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub series: u64,
    pub deleted_series: u64,
    pub label_names: u64,
    pub label_pairs: u64,
    pub date_entries: u64,
    pub days: u64,
    pub series_created: u64,
    pub compactions: u64,
    pub missing_metric_names: u64,
    pub tag_filters_cache: CacheStats,
    pub useless_filters_cache: CacheStats,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  Series: {} ({} deleted)", self.series, self.deleted_series)?;
        writeln!(
            f,
            "  Labels: {} names, {} pairs",
            self.label_names, self.label_pairs
        )?;
        writeln!(f, "  Per-day entries: {} over {} days", self.date_entries, self.days)?;
        writeln!(
            f,
            "  Created: {}, compactions: {}",
            self.series_created, self.compactions
        )?;
        writeln!(f, "  {}", self.tag_filters_cache)?;
        write!(f, "  {}", self.useless_filters_cache)
    }
}

/// What a compaction removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub segments: u64,
    pub series_removed: u64,
    pub days_removed: u64,
}

#[derive(Default)]
struct IndexState {
    metrics: MetricIndex,
    tags: TagIndex,
    dates: DateIndex,
    deleted: Arc<RoaringTreemap>,
}

impl IndexState {
    fn is_live(&self, metric_id: u64) -> bool {
        !self.deleted.contains(metric_id)
    }

    fn lookup_live(&self, name_key: &[u8]) -> Option<Tsid> {
        self.metrics
            .lookup(name_key)
            .filter(|t| self.is_live(t.metric_id))
    }

    fn apply(&mut self, item: IndexItem) -> StorageResult<()> {
        match item {
            IndexItem::Series {
                metric_id,
                tsid,
                metric_name,
            } => {
                if self.metrics.contains(metric_id) {
                    return Ok(());
                }
                let mn = MetricName::unmarshal(&metric_name)?;
                let replace = match self.metrics.lookup(&metric_name) {
                    Some(t) => !self.is_live(t.metric_id),
                    None => true,
                };
                self.tags.add(&mn, metric_id);
                self.metrics.insert(metric_name, Arc::new(mn), tsid, replace);
            }
            IndexItem::Date { date, metric_id } => {
                self.dates.add(date, metric_id);
            }
            IndexItem::DateSet { date, metric_ids } => {
                let ids = RoaringTreemap::deserialize_from(&metric_ids[..])
                    .map_err(|e| StorageError::Corruption(format!("per-day set: {}", e)))?;
                self.dates.add_set(date, ids);
            }
            IndexItem::Deleted { metric_ids } => {
                let deleted = Arc::make_mut(&mut self.deleted);
                deleted.extend(metric_ids);
            }
        }
        Ok(())
    }

    /// Drop entries of deleted series and days before `min_date`
    fn collect_garbage(&mut self, min_date: u64) -> CompactionStats {
        let mut stats = CompactionStats {
            days_removed: self.dates.drop_before(min_date) as u64,
            ..CompactionStats::default()
        };
        let dead = self.metrics.all() & &*self.deleted;
        for id in dead.iter() {
            if let Some(mn) = self.metrics.remove(id) {
                self.tags.remove(&mn, id);
                stats.series_removed += 1;
            }
        }
        if !dead.is_empty() {
            self.dates.remove_ids(&dead);
        }
        stats
    }

    /// Items that rebuild this state
    fn snapshot_items(&self) -> StorageResult<Vec<IndexItem>> {
        let mut items = Vec::with_capacity(self.metrics.len() + self.dates.days() + 1);
        if !self.deleted.is_empty() {
            items.push(IndexItem::Deleted {
                metric_ids: self.deleted.iter().collect(),
            });
        }
        for (metric_id, tsid, mn) in self.metrics.iter() {
            items.push(IndexItem::Series {
                metric_id,
                tsid,
                metric_name: mn.marshal(),
            });
        }
        for (date, ids) in self.dates.iter() {
            let mut metric_ids = Vec::with_capacity(ids.serialized_size());
            ids.serialize_into(&mut metric_ids)?;
            items.push(IndexItem::DateSet { date, metric_ids });
        }
        Ok(items)
    }
}

/// Compiled search plus the keys used for its cache entries
struct PreparedSearch {
    filters: Vec<CompiledFilter>,
    dates: Option<(u64, u64)>,
    cache_key: Vec<u8>,
}

/// The inverted index
pub struct IndexDb {
    state: RwLock<IndexState>,
    log: Mutex<ItemLog>,
    create_locks: Vec<Mutex<()>>,
    compaction: Mutex<()>,
    next_metric_id: AtomicU64,
    /// Bumped whenever search results may change
    generation: AtomicU64,
    filters_cache: BoundedCache<Vec<u8>, Arc<RoaringTreemap>>,
    useless_cache: BoundedCache<Vec<u8>, u64>,
    series_created: AtomicU64,
    compactions: AtomicU64,
    missing_metric_names: AtomicU64,
    config: IndexConfig,
}

impl IndexDb {
    /// Open the index stored in `dir`, replaying its item log
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> StorageResult<Self> {
        let dir = dir.as_ref();
        let (log, items) = ItemLog::open(dir, config.sync_mode)?;
        let item_count = items.len();
        let mut state = IndexState::default();
        for item in items {
            state.apply(item).map_err(|e| e.in_index("replay item log"))?;
        }

        let max_id = state
            .metrics
            .max_metric_id()
            .max(state.deleted.max().unwrap_or(0));
        let now_nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        let next_metric_id = (max_id + 1).max(now_nanos);

        tracing::info!(
            dir = ?dir,
            items = item_count,
            series = state.metrics.len(),
            "Index opened"
        );

        Ok(Self {
            state: RwLock::new(state),
            log: Mutex::new(log),
            create_locks: (0..CREATE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            compaction: Mutex::new(()),
            next_metric_id: AtomicU64::new(next_metric_id),
            generation: AtomicU64::new(1),
            filters_cache: BoundedCache::new("tag_filters", config.filters_cache_bytes),
            useless_cache: BoundedCache::new("useless_tag_filters", config.filters_cache_bytes / 8),
            series_created: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            missing_metric_names: AtomicU64::new(0),
            config,
        })
    }

    // ==================== Series registration ====================

    /// Look up a live series by its canonical marshaled name
    pub fn lookup_tsid(&self, name_key: &[u8]) -> Option<Tsid> {
        self.state.read().lookup_live(name_key)
    }

    /// Return the TSID of `mn`, registering the series on first sight.
    ///
    /// Concurrent calls for the same name return the same TSID; exactly
    /// one of them reports `created`.
    pub fn get_or_create_tsid(&self, mn: &MetricName, name_key: &[u8]) -> StorageResult<(Tsid, bool)> {
        if let Some(tsid) = self.lookup_tsid(name_key) {
            return Ok((tsid, false));
        }

        let stripe = xxh64(name_key, 0) as usize % CREATE_LOCK_STRIPES;
        let _guard = self.create_locks[stripe].lock();
        if let Some(tsid) = self.lookup_tsid(name_key) {
            return Ok((tsid, false));
        }

        let metric_id = self.next_metric_id.fetch_add(1, Ordering::Relaxed);
        let tsid = Tsid::generate(mn, metric_id);
        let item = IndexItem::Series {
            metric_id,
            tsid,
            metric_name: name_key.to_vec(),
        };
        {
            let mut log = self.log.lock();
            log.append(std::slice::from_ref(&item))
                .map_err(|e| e.in_index(format!("register series {}", mn)))?;
            self.state.write().apply(item)?;
        }
        self.bump_generation();
        self.series_created.fetch_add(1, Ordering::Relaxed);
        Ok((tsid, true))
    }

    /// True if the per-day entry exists
    pub fn has_date(&self, date: u64, metric_id: u64) -> bool {
        self.state.read().dates.contains(date, metric_id)
    }

    /// Record `(date, metric ID)` pairs; returns how many were new
    pub fn add_dates(&self, pairs: &[(u64, u64)]) -> StorageResult<usize> {
        let missing: Vec<IndexItem> = {
            let st = self.state.read();
            let mut seen = std::collections::HashSet::new();
            pairs
                .iter()
                .filter(|(d, id)| !st.dates.contains(*d, *id) && seen.insert((*d, *id)))
                .map(|&(date, metric_id)| IndexItem::Date { date, metric_id })
                .collect()
        };
        if missing.is_empty() {
            return Ok(0);
        }
        let added = missing.len();
        {
            let mut log = self.log.lock();
            log.append(&missing)
                .map_err(|e| e.in_index("register per-day entries"))?;
            let mut st = self.state.write();
            for item in missing {
                st.apply(item)?;
            }
        }
        self.bump_generation();
        Ok(added)
    }

    // ==================== Lookups ====================

    pub fn get_metric_name(&self, metric_id: u64) -> Option<Arc<MetricName>> {
        let st = self.state.read();
        if !st.is_live(metric_id) {
            return None;
        }
        st.metrics.metric_name(metric_id).cloned()
    }

    pub fn get_tsid(&self, metric_id: u64) -> Option<Tsid> {
        let st = self.state.read();
        st.metrics.tsid(metric_id).filter(|_| st.is_live(metric_id))
    }

    /// TSIDs with names for `ids`, sorted by TSID. IDs without a name
    /// are counted and skipped.
    pub fn resolve(&self, ids: &RoaringTreemap) -> Vec<(Tsid, Arc<MetricName>)> {
        let st = self.state.read();
        let mut out = Vec::with_capacity(ids.len() as usize);
        for id in ids.iter() {
            match (st.metrics.tsid(id), st.metrics.metric_name(id)) {
                (Some(tsid), Some(mn)) => out.push((tsid, mn.clone())),
                _ => {
                    self.missing_metric_names.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        drop(st);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn is_deleted(&self, metric_id: u64) -> bool {
        self.state.read().deleted.contains(metric_id)
    }

    /// Current tombstones, shared with merges
    pub fn deleted(&self) -> Arc<RoaringTreemap> {
        self.state.read().deleted.clone()
    }

    /// Live series count from index metadata
    pub fn series_count(&self) -> u64 {
        let st = self.state.read();
        let all = st.metrics.all();
        all.len() - (all & &*st.deleted).len()
    }

    // ==================== Search ====================

    fn prepare(&self, filters: &[TagFilter], tr: &TimeRange) -> StorageResult<PreparedSearch> {
        let compiled = filters
            .iter()
            .map(CompiledFilter::compile)
            .collect::<StorageResult<Vec<_>>>()?;
        let (min_date, max_date) = tr.date_span();
        let dates = (tr.min_timestamp > 0
            && max_date - min_date < self.config.max_days_for_date_search)
            .then_some((min_date, max_date));

        let mut texts: Vec<&str> = compiled.iter().map(|f| f.text()).collect();
        texts.sort_unstable();
        let mut cache_key = Vec::with_capacity(64);
        cache_key.extend_from_slice(&self.generation.load(Ordering::Acquire).to_le_bytes());
        match dates {
            Some((a, b)) => {
                cache_key.extend_from_slice(&a.to_le_bytes());
                cache_key.extend_from_slice(&b.to_le_bytes());
            }
            None => cache_key.push(0xFF),
        }
        for t in texts {
            cache_key.extend_from_slice(t.as_bytes());
            cache_key.push(0);
        }
        Ok(PreparedSearch {
            filters: compiled,
            dates,
            cache_key,
        })
    }

    fn useless_key(&self, search: &PreparedSearch, filter: &CompiledFilter) -> Vec<u8> {
        let mut key = search.cache_key[..8].to_vec();
        if let Some((a, b)) = search.dates {
            key.extend_from_slice(&a.to_le_bytes());
            key.extend_from_slice(&b.to_le_bytes());
        }
        key.extend_from_slice(filter.text().as_bytes());
        key
    }

    /// Metric IDs of live series matching every filter and having samples
    /// in `tr` (day granularity for ranges up to the per-day limit).
    ///
    /// Fails with `TooManyMatches` when more than `max_metrics` series match.
    pub fn search_metric_ids(
        &self,
        filters: &[TagFilter],
        tr: &TimeRange,
        max_metrics: usize,
    ) -> StorageResult<Arc<RoaringTreemap>> {
        let search = self.prepare(filters, tr)?;
        if let Some(hit) = self.filters_cache.get(&search.cache_key) {
            if hit.len() > max_metrics as u64 {
                return Err(StorageError::TooManyMatches { limit: max_metrics });
            }
            return Ok(hit);
        }
        for f in search.filters.iter().filter(|f| f.is_regexp) {
            if self.useless_cache.contains(&self.useless_key(&search, f)) {
                return Ok(Arc::new(RoaringTreemap::new()));
            }
        }

        let ids = Arc::new(self.search_uncached(&search, max_metrics)?);
        self.filters_cache.put(search.cache_key, ids.clone());
        Ok(ids)
    }

    fn search_uncached(&self, search: &PreparedSearch, max_metrics: usize) -> StorageResult<RoaringTreemap> {
        let st = self.state.read();
        let mut universe = match search.dates {
            Some((a, b)) => st.dates.union_range(a, b),
            None => st.metrics.all().clone(),
        };
        universe -= &*st.deleted;

        // Cheapest filters first: exact ones by postings size, then the
        // rest, then the ones that only subtract.
        let mut order: Vec<(u8, u64, &CompiledFilter)> = search
            .filters
            .iter()
            .map(|f| match f.exact_postings_len(&st.tags) {
                Some(n) if f.is_exact_positive() => (0, n, f),
                _ if !f.is_negative => (1, 0, f),
                _ => (2, 0, f),
            })
            .collect();
        order.sort_by_key(|(class, n, _)| (*class, *n));

        let mut candidates: Option<RoaringTreemap> = None;
        let mut deferred: Vec<&CompiledFilter> = Vec::new();
        for (_, _, f) in order {
            if let Some(c) = &candidates {
                if self.should_verify(f, c.len(), &st.tags) {
                    deferred.push(f);
                    continue;
                }
            }
            let set = f.evaluate(&st.tags);
            if !set.complement && set.ids.is_empty() {
                if f.is_regexp {
                    self.useless_cache.put(self.useless_key(search, f), 1);
                }
                return Ok(RoaringTreemap::new());
            }
            let next = match (candidates.take(), set.complement) {
                (None, false) => &set.ids & &universe,
                (None, true) => &universe - &set.ids,
                (Some(mut c), false) => {
                    c &= &set.ids;
                    c
                }
                (Some(mut c), true) => {
                    c -= &set.ids;
                    c
                }
            };
            if next.is_empty() {
                return Ok(next);
            }
            candidates = Some(next);
        }

        let mut result = candidates.unwrap_or(universe);
        if result.len() > max_metrics as u64 {
            return Err(StorageError::TooManyMatches { limit: max_metrics });
        }
        if !deferred.is_empty() {
            let mut rejected = RoaringTreemap::new();
            for id in result.iter() {
                let keep = st
                    .metrics
                    .metric_name(id)
                    .map(|mn| deferred.iter().all(|f| f.matches(mn)))
                    .unwrap_or(false);
                if !keep {
                    rejected.insert(id);
                }
            }
            result -= rejected;
        }
        Ok(result)
    }

    fn should_verify(&self, f: &CompiledFilter, candidates: u64, tags: &TagIndex) -> bool {
        if f.is_regexp && candidates <= self.config.verify_regex_max_candidates {
            return true;
        }
        match f.exact_postings_len(tags) {
            Some(n) => n > candidates.saturating_mul(self.config.verify_postings_ratio),
            None => false,
        }
    }

    /// Names of matching series, sorted by TSID
    pub fn search_metric_names(
        &self,
        filters: &[TagFilter],
        tr: &TimeRange,
        max_metrics: usize,
    ) -> StorageResult<Vec<(Tsid, Arc<MetricName>)>> {
        let ids = self.search_metric_ids(filters, tr, max_metrics)?;
        Ok(self.resolve(&ids))
    }

    /// Label names of matching series, ascending, at most `limit`
    pub fn search_label_names(
        &self,
        filters: &[TagFilter],
        tr: &TimeRange,
        limit: usize,
        max_metrics: usize,
    ) -> StorageResult<Truncated<String>> {
        let ids = self.scope(filters, tr, max_metrics)?;
        let st = self.state.read();
        let keys = st.tags.keys().filter(|key| match &ids {
            None => true,
            Some(ids) => st.tags.values(key).any(|(_, p)| !p.is_disjoint(ids)),
        });
        Ok(take_limited(keys.map(String::from), limit))
    }

    /// Values of `key` among matching series, ascending, at most `limit`
    pub fn search_label_values(
        &self,
        key: &str,
        filters: &[TagFilter],
        tr: &TimeRange,
        limit: usize,
        max_metrics: usize,
    ) -> StorageResult<Truncated<String>> {
        let ids = self.scope(filters, tr, max_metrics)?;
        let st = self.state.read();
        let values = st
            .tags
            .values(key)
            .filter(|(_, postings)| match &ids {
                None => true,
                Some(ids) => !postings.is_disjoint(ids),
            })
            .map(|(v, _)| v.to_string());
        Ok(take_limited(values, limit))
    }

    /// Label names with their values, both ascending and capped
    pub fn search_tag_entries(
        &self,
        max_keys: usize,
        max_values: usize,
    ) -> Truncated<TagEntry> {
        let st = self.state.read();
        let deleted = st.deleted.clone();
        let mut truncated = false;
        let keys = st.tags.keys().map(|key| {
            let values = take_limited(
                st.tags
                    .values(key)
                    .filter(|(_, p)| !(*p - &*deleted).is_empty())
                    .map(|(v, _)| v.to_string()),
                max_values,
            );
            truncated |= values.truncated;
            TagEntry {
                key: key.to_string(),
                values: values.items,
            }
        });
        let mut entries = take_limited(keys.filter(|e| !e.values.is_empty()), max_keys);
        entries.truncated |= truncated;
        entries
    }

    /// Series in scope of a label enumeration; `None` means all of them
    fn scope(
        &self,
        filters: &[TagFilter],
        tr: &TimeRange,
        max_metrics: usize,
    ) -> StorageResult<Option<Arc<RoaringTreemap>>> {
        let unbounded = tr.min_timestamp <= 0 && tr.max_timestamp == i64::MAX;
        if filters.is_empty() && unbounded && self.state.read().deleted.is_empty() {
            return Ok(None);
        }
        self.search_metric_ids(filters, tr, max_metrics).map(Some)
    }

    // ==================== Deletion ====================

    /// Tombstone every series matching `filters`; returns their IDs
    pub fn delete_series(&self, filters: &[TagFilter], max_metrics: usize) -> StorageResult<RoaringTreemap> {
        let ids = self.search_metric_ids(filters, &TimeRange::all(), max_metrics)?;
        if ids.is_empty() {
            return Ok(RoaringTreemap::new());
        }
        let item = IndexItem::Deleted {
            metric_ids: ids.iter().collect(),
        };
        {
            let mut log = self.log.lock();
            log.append(std::slice::from_ref(&item))
                .map_err(|e| e.in_index("record tombstones"))?;
            log.sync()?;
            self.state.write().apply(item)?;
        }
        self.bump_generation();
        self.filters_cache.reset();
        tracing::info!(series = ids.len(), "Series deleted");
        Ok((*ids).clone())
    }

    // ==================== Maintenance ====================

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Rotate the log when the active segment is large and compact when
    /// enough segments were sealed
    pub fn maintain(&self, min_date: u64) -> StorageResult<Option<CompactionStats>> {
        let sealed = {
            let mut log = self.log.lock();
            if log.active_bytes() > self.config.max_segment_bytes {
                log.rotate()?;
            }
            log.sealed_segments()?
        };
        if sealed >= self.config.compact_after_segments {
            return self.compact(min_date).map(Some);
        }
        Ok(None)
    }

    /// Merge all log segments into one snapshot, collecting entries of
    /// deleted series and per-day entries before `min_date`
    pub fn compact(&self, min_date: u64) -> StorageResult<CompactionStats> {
        let _running = self.compaction.lock();
        let (sealed, stats, items) = {
            let mut log = self.log.lock();
            let sealed = log.rotate()?;
            let segments = log.sealed_segments()? as u64;
            let mut st = self.state.write();
            let mut stats = st.collect_garbage(min_date);
            stats.segments = segments;
            let st = RwLockWriteGuard::downgrade(st);
            drop(log);
            (sealed, stats, st.snapshot_items()?)
        };
        let dir = self.log.lock().dir().to_path_buf();
        write_snapshot(&dir, &items, sealed).map_err(|e| e.in_index("write compacted index"))?;
        if stats.series_removed > 0 || stats.days_removed > 0 {
            self.bump_generation();
        }
        self.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            segments = stats.segments,
            series_removed = stats.series_removed,
            days_removed = stats.days_removed,
            items = items.len(),
            "Index compacted"
        );
        Ok(stats)
    }

    /// Write the current state as a compacted index into `dst`
    pub fn snapshot_to(&self, dst: &Path) -> StorageResult<()> {
        std::fs::create_dir_all(dst)?;
        let items = self.state.read().snapshot_items()?;
        write_snapshot(dst, &items, 0).map_err(|e| e.in_index("write index snapshot"))
    }

    /// Flush and fsync the item log
    pub fn sync(&self) -> StorageResult<()> {
        self.log.lock().sync()
    }

    /// Shed half of the result caches
    pub fn shed_caches(&self) {
        self.filters_cache.shed(0.5);
        self.useless_cache.shed(0.5);
    }

    pub fn stats(&self) -> IndexStats {
        let st = self.state.read();
        let all = st.metrics.all();
        let deleted = (all & &*st.deleted).len();
        IndexStats {
            series: all.len() - deleted,
            deleted_series: deleted,
            label_names: st.tags.key_count() as u64,
            label_pairs: st.tags.pair_count() as u64,
            date_entries: st.dates.entries(),
            days: st.dates.days() as u64,
            series_created: self.series_created.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            missing_metric_names: self.missing_metric_names.load(Ordering::Relaxed),
            tag_filters_cache: self.filters_cache.stats(),
            useless_filters_cache: self.useless_cache.stats(),
        }
    }
}

fn take_limited<T>(iter: impl Iterator<Item = T>, limit: usize) -> Truncated<T> {
    let mut items = Vec::new();
    let mut truncated = false;
    for item in iter {
        if items.len() == limit {
            truncated = true;
            break;
        }
        items.push(item);
    }
    Truncated { items, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> IndexDb {
        IndexDb::open(dir, IndexConfig::default()).unwrap()
    }

    fn create(db: &IndexDb, mn: &MetricName) -> Tsid {
        db.get_or_create_tsid(mn, &mn.marshal()).unwrap().0
    }

    fn cpu(host: &str) -> MetricName {
        MetricName::new("cpu", vec![]).tag("host", host)
    }

    fn ids(db: &IndexDb, filters: &[TagFilter]) -> Vec<u64> {
        db.search_metric_ids(filters, &TimeRange::all(), 1000)
            .unwrap()
            .iter()
            .collect()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mn = cpu("a");
        let (first, created) = db.get_or_create_tsid(&mn, &mn.marshal()).unwrap();
        assert!(created);
        let (second, created) = db.get_or_create_tsid(&mn, &mn.marshal()).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(db.series_count(), 1);
    }

    #[test]
    fn test_concurrent_creation_converges() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mn = cpu("shared");
        let key = mn.marshal();
        let results: Vec<(Tsid, bool)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| s.spawn(|| db.get_or_create_tsid(&mn, &key).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|(t, _)| *t == results[0].0));
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert_eq!(db.stats().series_created, 1);
    }

    #[test]
    fn test_tag_filter_search() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let a = create(&db, &cpu("a")).metric_id;
        let b = create(&db, &cpu("b")).metric_id;
        let m = create(&db, &MetricName::new("mem", vec![]).tag("host", "a")).metric_id;

        assert_eq!(ids(&db, &[TagFilter::metric("cpu"), TagFilter::eq("host", "a")]), vec![a]);
        assert_eq!(ids(&db, &[TagFilter::metric("cpu")]), vec![a, b]);
        assert_eq!(ids(&db, &[TagFilter::eq("host", "a")]), vec![a, m]);
        // negation is the complement within the universe
        assert_eq!(ids(&db, &[TagFilter::neq("host", "a")]), vec![b]);
        assert_eq!(ids(&db, &[TagFilter::metric("cpu"), TagFilter::regex("host", "a|b")]), vec![a, b]);
        assert!(ids(&db, &[TagFilter::regex("host", "z.*")]).is_empty());
    }

    #[test]
    fn test_verification_matches_materialised_result() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        for i in 0..50 {
            create(&db, &cpu(&format!("web-{}", i)));
        }
        let target = create(&db, &MetricName::new("rare", vec![]).tag("host", "web-7")).metric_id;
        // the regex runs on names because the candidate set is tiny
        let got = ids(&db, &[TagFilter::metric("rare"), TagFilter::regex("host", "web-[0-9]")]);
        assert_eq!(got, vec![target]);
        let got = ids(&db, &[TagFilter::metric("rare"), TagFilter::not_regex("host", "web-7")]);
        assert!(got.is_empty());
    }

    #[test]
    fn test_too_many_matches() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        for i in 0..10 {
            create(&db, &cpu(&i.to_string()));
        }
        let err = db
            .search_metric_ids(&[TagFilter::metric("cpu")], &TimeRange::all(), 5)
            .unwrap_err();
        assert!(matches!(err, StorageError::TooManyMatches { limit: 5 }));
    }

    #[test]
    fn test_date_restricted_search() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let a = create(&db, &cpu("a")).metric_id;
        let b = create(&db, &cpu("b")).metric_id;
        db.add_dates(&[(100, a), (101, b)]).unwrap();

        let day = crate::storage::types::MSECS_PER_DAY;
        let tr = TimeRange::try_new(100 * day, 100 * day + 1).unwrap();
        let got: Vec<u64> = db
            .search_metric_ids(&[TagFilter::metric("cpu")], &tr, 100)
            .unwrap()
            .iter()
            .collect();
        assert_eq!(got, vec![a]);
        assert!(db.has_date(101, b));
        assert_eq!(db.add_dates(&[(101, b)]).unwrap(), 0);
    }

    #[test]
    fn test_delete_then_recreate() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let mn = cpu("a");
        let old = create(&db, &mn);
        create(&db, &cpu("b"));

        let deleted = db.delete_series(&[TagFilter::eq("host", "a")], 100).unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(db.is_deleted(old.metric_id));
        assert!(db.get_metric_name(old.metric_id).is_none());
        assert_eq!(ids(&db, &[TagFilter::metric("cpu")]).len(), 1);
        assert_eq!(db.series_count(), 1);

        let new = create(&db, &mn);
        assert_ne!(new.metric_id, old.metric_id);
        assert_eq!(db.lookup_tsid(&mn.marshal()), Some(new));
    }

    #[test]
    fn test_label_enumeration_is_sorted_and_truncated() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        for host in ["c", "a", "b"] {
            create(&db, &cpu(host));
        }
        create(&db, &MetricName::new("mem", vec![]).tag("dc", "eu"));

        let names = db.search_label_names(&[], &TimeRange::all(), 10, 100).unwrap();
        assert_eq!(names.items, vec!["__name__", "dc", "host"]);
        assert!(!names.truncated);

        let values = db
            .search_label_values("host", &[], &TimeRange::all(), 2, 100)
            .unwrap();
        assert_eq!(values.items, vec!["a", "b"]);
        assert!(values.truncated);

        let scoped = db
            .search_label_names(&[TagFilter::metric("cpu")], &TimeRange::all(), 10, 100)
            .unwrap();
        assert_eq!(scoped.items, vec!["__name__", "host"]);

        let entries = db.search_tag_entries(10, 1);
        assert_eq!(entries.items.len(), 3);
        assert!(entries.truncated);
    }

    #[test]
    fn test_reopen_and_compaction() {
        let dir = tempdir().unwrap();
        let (a, b);
        {
            let db = open(dir.path());
            a = create(&db, &cpu("a"));
            b = create(&db, &cpu("b"));
            db.add_dates(&[(1, a.metric_id), (500, b.metric_id)]).unwrap();
            db.delete_series(&[TagFilter::eq("host", "b")], 100).unwrap();
            let stats = db.compact(100).unwrap();
            assert_eq!(stats.series_removed, 1);
            assert_eq!(stats.days_removed, 1);
            db.sync().unwrap();
        }
        let db = open(dir.path());
        assert_eq!(db.lookup_tsid(&cpu("a").marshal()), Some(a));
        assert!(db.lookup_tsid(&cpu("b").marshal()).is_none());
        assert!(db.is_deleted(b.metric_id));
        assert!(!db.has_date(1, a.metric_id));
        assert_eq!(db.series_count(), 1);

        // new IDs never reuse old ones
        let c = create(&db, &cpu("c"));
        assert!(c.metric_id > b.metric_id);
    }

    #[test]
    fn test_snapshot_opens_as_index() {
        let dir = tempdir().unwrap();
        let db = open(&dir.path().join("live"));
        let a = create(&db, &cpu("a"));
        db.add_dates(&[(10, a.metric_id)]).unwrap();

        let dst = dir.path().join("snap");
        db.snapshot_to(&dst).unwrap();
        create(&db, &cpu("later"));

        let snap = open(&dst);
        assert_eq!(snap.series_count(), 1);
        assert_eq!(snap.lookup_tsid(&cpu("a").marshal()), Some(a));
        assert!(snap.has_date(10, a.metric_id));
    }
}
