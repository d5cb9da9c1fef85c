//! Caches in front of the index
//!
//! - **tsid**: marshaled metric name → TSID
//! - **metric_id**: metric ID → TSID, also answers "does this ID exist"
//! - **date_metric_id**: (day, metric ID) pairs already marked in the per-day index
//! - **recent_hour**: metric IDs with samples in the current and previous hour
//!
//! All caches are derived state: dropping them costs throughput, never
//! correctness. Their sizes come from a [`MemoryBudget`], and they shed
//! entries when the host runs low on memory.

pub mod bounded;
pub mod memory;

pub use bounded::{BoundedCache, EntrySize};
pub use memory::{MemoryBudget, MemoryMonitor};

use crate::storage::tsid::Tsid;
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

impl EntrySize for Tsid {
    fn entry_size(&self) -> usize {
        std::mem::size_of::<Tsid>()
    }
}

/// Counters of one cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub entries: u64,
    pub size_bytes: u64,
    pub max_bytes: u64,
    pub requests: u64,
    pub misses: u64,
    pub collisions: u64,
    pub evictions: u64,
    pub resets: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: entries={}, size={:.2} MB, requests={}, misses={}, evictions={}",
            self.name,
            self.entries,
            self.size_bytes as f64 / (1024.0 * 1024.0),
            self.requests,
            self.misses,
            self.evictions
        )
    }
}

#[derive(Default)]
struct DateGenerations {
    current: HashMap<u64, RoaringTreemap>,
    previous: HashMap<u64, RoaringTreemap>,
    current_entries: u64,
}

/// Two-generation set of (date, metric ID) pairs
///
/// When the current generation exceeds its entry budget it becomes the
/// previous one; hits in the previous generation are promoted.
pub struct DateMetricIdCache {
    inner: RwLock<DateGenerations>,
    max_entries: u64,
    requests: AtomicU64,
    misses: AtomicU64,
    rotations: AtomicU64,
}

impl DateMetricIdCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(DateGenerations::default()),
            // roaring sets of dense IDs cost a few bytes per entry
            max_entries: (max_bytes / 4).max(1024) as u64,
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn has(&self, date: u64, metric_id: u64) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let in_previous = {
            let g = self.inner.read();
            if g.current.get(&date).map(|s| s.contains(metric_id)).unwrap_or(false) {
                return true;
            }
            g.previous.get(&date).map(|s| s.contains(metric_id)).unwrap_or(false)
        };
        if in_previous {
            self.set(date, metric_id);
            return true;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub fn set(&self, date: u64, metric_id: u64) {
        let mut guard = self.inner.write();
        let g = &mut *guard;
        if g.current.entry(date).or_default().insert(metric_id) {
            g.current_entries += 1;
        }
        if g.current_entries > self.max_entries {
            g.previous = std::mem::take(&mut g.current);
            g.current_entries = 0;
            self.rotations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop the older generation
    pub fn shed(&self) {
        self.inner.write().previous.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let g = self.inner.read();
        let entries: u64 = g.current.values().chain(g.previous.values()).map(|s| s.len()).sum();
        let size_bytes: u64 = g
            .current
            .values()
            .chain(g.previous.values())
            .map(|s| s.serialized_size() as u64)
            .sum();
        CacheStats {
            name: "date_metric_id",
            entries,
            size_bytes,
            max_bytes: self.max_entries * 4,
            requests: self.requests.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collisions: 0,
            evictions: self.rotations.load(Ordering::Relaxed),
            resets: 0,
        }
    }
}

#[derive(Default)]
struct HourSets {
    hour: u64,
    current: RoaringTreemap,
    previous: RoaringTreemap,
    /// Hours after `hour` that rows stamped in the future already reached
    future: BTreeMap<u64, RoaringTreemap>,
    /// Sets are complete for hours at or after this one
    complete_from: u64,
}

/// Metric IDs seen in the current and the previous hour
///
/// Rows may carry timestamps up to the future skew ahead of now; their
/// hours are kept aside and become the current set once the clock gets
/// there. The sets are complete for hours no row could have reached
/// before the cache started (or before the state saved by the last clean
/// shutdown), which lets searches over the last two hours use them
/// instead of the per-day index.
pub struct RecentHourCache {
    inner: RwLock<HourSets>,
    requests: AtomicU64,
    misses: AtomicU64,
}

impl RecentHourCache {
    /// Start empty; sets become complete after the furthest hour an
    /// earlier row may have been stamped with
    pub fn new(now_hour: u64, future_hours: u64) -> Self {
        Self {
            inner: RwLock::new(HourSets {
                hour: now_hour,
                complete_from: now_hour + future_hours + 1,
                ..HourSets::default()
            }),
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn rotate_to(g: &mut HourSets, hour: u64) {
        if hour <= g.hour {
            return;
        }
        let current = std::mem::take(&mut g.current);
        g.previous = if hour == g.hour + 1 {
            current
        } else {
            g.future.remove(&(hour - 1)).unwrap_or_default()
        };
        g.current = g.future.remove(&hour).unwrap_or_default();
        g.future = g.future.split_off(&(hour + 1));
        g.hour = hour;
    }

    /// True if a sample of `metric_id` in `hour` was already recorded
    pub fn knows(&self, hour: u64, metric_id: u64) -> bool {
        let g = self.inner.read();
        if hour == g.hour {
            g.current.contains(metric_id)
        } else if hour + 1 == g.hour {
            g.previous.contains(metric_id)
        } else {
            g.future.get(&hour).map(|s| s.contains(metric_id)).unwrap_or(false)
        }
    }

    /// Record a sample of `metric_id` in `hour`, with the clock at `now_hour`
    pub fn add(&self, hour: u64, metric_id: u64, now_hour: u64) {
        if self.knows(hour, metric_id) {
            return;
        }
        let mut guard = self.inner.write();
        let g = &mut *guard;
        Self::rotate_to(g, now_hour);
        if hour == g.hour {
            g.current.insert(metric_id);
        } else if hour + 1 == g.hour {
            g.previous.insert(metric_id);
        } else if hour > g.hour {
            g.future.entry(hour).or_default().insert(metric_id);
        }
    }

    /// Every metric ID with samples in `[min_hour, max_hour]`, when the
    /// cache knows them all; `None` otherwise
    pub fn metric_ids_for(&self, min_hour: u64, max_hour: u64, now_hour: u64) -> Option<RoaringTreemap> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut g = self.inner.write();
        Self::rotate_to(&mut g, now_hour);
        let oldest = g.hour.saturating_sub(1);
        if min_hour < oldest || min_hour < g.complete_from || max_hour > g.hour {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut out = RoaringTreemap::new();
        if min_hour <= g.hour && max_hour >= g.hour {
            out |= &g.current;
        }
        if min_hour <= oldest && max_hour >= oldest && g.hour > 0 {
            out |= &g.previous;
        }
        Some(out)
    }

    /// Persist the sets so a clean restart keeps them complete
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let g = self.inner.read();
        let mut buf = Vec::new();
        buf.extend_from_slice(&g.hour.to_le_bytes());
        buf.extend_from_slice(&g.complete_from.to_le_bytes());
        put_set(&mut buf, &g.current)?;
        put_set(&mut buf, &g.previous)?;
        buf.extend_from_slice(&(g.future.len() as u64).to_le_bytes());
        for (hour, set) in &g.future {
            buf.extend_from_slice(&hour.to_le_bytes());
            put_set(&mut buf, set)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, path)
    }

    /// Load state saved by [`save`](Self::save) and delete the file, so a
    /// crash before the next clean shutdown cannot reuse stale sets
    pub fn load(path: &Path, now_hour: u64, future_hours: u64) -> Self {
        let cache = Self::new(now_hour, future_hours);
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(_) => return cache,
        };
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = ?path, "cannot remove recent hour cache file: {}", e);
        }
        match Self::decode(&data) {
            Some(sets) if sets.hour <= now_hour => {
                let mut g = cache.inner.write();
                *g = sets;
                Self::rotate_to(&mut g, now_hour);
            }
            _ => tracing::warn!(path = ?path, "ignoring invalid recent hour cache file"),
        }
        cache
    }

    fn decode(data: &[u8]) -> Option<HourSets> {
        let mut pos = 0;
        let hour = take_u64(data, &mut pos)?;
        let complete_from = take_u64(data, &mut pos)?;
        let current = take_set(data, &mut pos)?;
        let previous = take_set(data, &mut pos)?;
        let mut future = BTreeMap::new();
        for _ in 0..take_u64(data, &mut pos)? {
            let h = take_u64(data, &mut pos)?;
            future.insert(h, take_set(data, &mut pos)?);
        }
        Some(HourSets {
            hour,
            current,
            previous,
            future,
            complete_from,
        })
    }

    pub fn stats(&self) -> CacheStats {
        let g = self.inner.read();
        let future_entries: u64 = g.future.values().map(|s| s.len()).sum();
        let future_bytes: usize = g.future.values().map(|s| s.serialized_size()).sum();
        CacheStats {
            name: "recent_hour",
            entries: g.current.len() + g.previous.len() + future_entries,
            size_bytes: (g.current.serialized_size() + g.previous.serialized_size() + future_bytes) as u64,
            max_bytes: 0,
            requests: self.requests.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collisions: 0,
            evictions: 0,
            resets: 0,
        }
    }
}

fn put_set(buf: &mut Vec<u8>, set: &RoaringTreemap) -> std::io::Result<()> {
    let mut data = Vec::with_capacity(set.serialized_size());
    set.serialize_into(&mut data)?;
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    buf.extend_from_slice(&data);
    Ok(())
}

fn take_u64(data: &[u8], pos: &mut usize) -> Option<u64> {
    let b: [u8; 8] = data.get(*pos..*pos + 8)?.try_into().ok()?;
    *pos += 8;
    Some(u64::from_le_bytes(b))
}

fn take_set(data: &[u8], pos: &mut usize) -> Option<RoaringTreemap> {
    let len = take_u64(data, pos)? as usize;
    let raw = data.get(*pos..pos.checked_add(len)?)?;
    *pos += len;
    RoaringTreemap::deserialize_from(raw).ok()
}

/// The four caches used by ingestion and search
pub struct StorageCaches {
    pub tsid: BoundedCache<Vec<u8>, Tsid>,
    pub metric_id: BoundedCache<u64, Tsid>,
    pub date_metric_id: DateMetricIdCache,
    pub recent_hour: RecentHourCache,
    monitor: MemoryMonitor,
    sheds: AtomicU64,
}

impl StorageCaches {
    pub fn new(budget: MemoryBudget, recent_hour: RecentHourCache) -> Self {
        Self {
            tsid: BoundedCache::new("tsid", budget.share(0.10, 1 << 20)),
            metric_id: BoundedCache::new("metric_id", budget.share(0.05, 1 << 20)),
            date_metric_id: DateMetricIdCache::new(budget.share(0.025, 1 << 20)),
            recent_hour,
            monitor: MemoryMonitor::new(),
            sheds: AtomicU64::new(0),
        }
    }

    /// Shed half of every cache when the host is low on memory.
    /// Returns true if entries were dropped.
    pub fn maintain(&self) -> bool {
        if !self.monitor.under_pressure() {
            return false;
        }
        self.tsid.shed(0.5);
        self.metric_id.shed(0.5);
        self.date_metric_id.shed();
        self.sheds.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("low available memory, caches shed half of their entries");
        true
    }

    /// Times the caches were shed under memory pressure
    pub fn sheds(&self) -> u64 {
        self.sheds.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![
            self.tsid.stats(),
            self.metric_id.stats(),
            self.date_metric_id.stats(),
            self.recent_hour.stats(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_date_metric_id_generations() {
        let cache = DateMetricIdCache::new(0);
        let max = cache.max_entries;
        for id in 0..=max {
            cache.set(1, id);
        }
        // rotation moved everything to the previous generation
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.has(1, 0));
        assert!(!cache.has(2, 0));
        cache.shed();
        // promoted entry survived the shed
        assert!(cache.has(1, 0));
        assert!(!cache.has(1, 5));
    }

    #[test]
    fn test_recent_hour_rotation() {
        let cache = RecentHourCache::new(100, 0);
        cache.add(100, 1, 100);
        cache.add(101, 2, 101);
        assert!(cache.knows(100, 1));
        assert!(cache.knows(101, 2));
        cache.add(103, 3, 103);
        assert!(!cache.knows(100, 1));
        assert!(!cache.knows(101, 2));
        assert!(cache.knows(103, 3));
    }

    #[test]
    fn test_recent_hour_completeness() {
        let cache = RecentHourCache::new(100, 0);
        cache.add(100, 1, 100);
        // hour 100 started before the cache did
        assert!(cache.metric_ids_for(100, 100, 100).is_none());
        cache.add(101, 2, 101);
        let ids = cache.metric_ids_for(101, 101, 101).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![2]);
        assert!(cache.metric_ids_for(99, 101, 101).is_none());
    }

    #[test]
    fn test_recent_hour_keeps_rows_stamped_ahead() {
        let cache = RecentHourCache::new(100, 1);
        // a row stamped up to one hour ahead may already sit in hour 101
        assert!(cache.metric_ids_for(101, 101, 101).is_none());

        cache.add(102, 1, 102);
        cache.add(103, 2, 102);
        assert!(cache.knows(103, 2));
        let ids = cache.metric_ids_for(102, 102, 102).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![1]);
        assert!(cache.metric_ids_for(102, 103, 102).is_none());

        // the clock reaches the hour the second row was stamped with
        let ids = cache.metric_ids_for(103, 103, 103).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![2]);
        let ids = cache.metric_ids_for(102, 103, 103).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![1, 2]);

        // jumping ahead keeps a stamped hour that became the previous one
        cache.add(106, 3, 103);
        let ids = cache.metric_ids_for(106, 107, 107).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_recent_hour_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recent_hour.bin");
        let cache = RecentHourCache::new(99, 0);
        cache.add(100, 1, 100);
        cache.add(101, 2, 101);
        cache.add(102, 3, 101);
        cache.save(&path).unwrap();

        let loaded = RecentHourCache::load(&path, 101, 0);
        assert!(!path.exists());
        assert!(loaded.knows(100, 1));
        assert!(loaded.knows(101, 2));
        assert!(loaded.knows(102, 3));
        let ids = loaded.metric_ids_for(100, 101, 101).unwrap();
        assert_eq!(ids.len(), 2);
        let ids = loaded.metric_ids_for(102, 102, 102).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![3]);
    }
}
