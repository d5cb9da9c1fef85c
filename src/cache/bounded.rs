//! Byte-bounded LRU cache with request counters

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use super::CacheStats;

/// Approximate heap footprint of a cache entry
pub trait EntrySize {
    fn entry_size(&self) -> usize;
}

impl EntrySize for Vec<u8> {
    fn entry_size(&self) -> usize {
        self.len() + 24
    }
}

impl EntrySize for u64 {
    fn entry_size(&self) -> usize {
        8
    }
}

/// Per-entry bookkeeping overhead of the LRU list and hash table
const ENTRY_OVERHEAD: usize = 64;

struct Inner<K, V> {
    lru: LruCache<K, V>,
    bytes: usize,
}

/// LRU cache bounded by the estimated bytes of its entries
pub struct BoundedCache<K: Hash + Eq, V> {
    name: &'static str,
    inner: Mutex<Inner<K, V>>,
    max_bytes: usize,
    requests: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
    evictions: AtomicU64,
    resets: AtomicU64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + EntrySize,
    V: Clone + PartialEq + EntrySize,
{
    pub fn new(name: &'static str, max_bytes: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                bytes: 0,
            }),
            max_bytes: max_bytes.max(1024),
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let found = self.inner.lock().lru.get(key).cloned();
        if found.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn put(&self, key: K, value: V) {
        let key_size = key.entry_size();
        let size = key_size + value.entry_size() + ENTRY_OVERHEAD;
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.put(key, value.clone()) {
            if old != value {
                self.collisions.fetch_add(1, Ordering::Relaxed);
            }
            let replaced = key_size + old.entry_size() + ENTRY_OVERHEAD;
            inner.bytes = inner.bytes.saturating_sub(replaced);
        }
        inner.bytes += size;
        while inner.bytes > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((k, v)) => {
                    let freed = k.entry_size() + v.entry_size() + ENTRY_OVERHEAD;
                    inner.bytes = inner.bytes.saturating_sub(freed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some((k, v)) = inner.lru.pop_entry(key) {
            let freed = k.entry_size() + v.entry_size() + ENTRY_OVERHEAD;
            inner.bytes = inner.bytes.saturating_sub(freed);
        }
    }

    /// Drop every entry
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.bytes = 0;
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict the least recently used `fraction` of entries
    pub fn shed(&self, fraction: f64) -> usize {
        let mut inner = self.inner.lock();
        let target = (inner.lru.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        for _ in 0..target {
            match inner.lru.pop_lru() {
                Some((k, v)) => {
                    let freed = k.entry_size() + v.entry_size() + ENTRY_OVERHEAD;
                    inner.bytes = inner.bytes.saturating_sub(freed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        target
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            name: self.name,
            entries: inner.lru.len() as u64,
            size_bytes: inner.bytes as u64,
            max_bytes: self.max_bytes as u64,
            requests: self.requests.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_bound_evicts_lru() {
        let per_entry = 8 + 8 + ENTRY_OVERHEAD;
        let cache: BoundedCache<u64, u64> = BoundedCache::new("test", per_entry * 20);
        for i in 0..20 {
            cache.put(i, i);
        }
        assert_eq!(cache.len(), 20);
        // touch 0 so 1 becomes the oldest
        assert_eq!(cache.get(&0), Some(0));
        cache.put(100, 100);
        assert_eq!(cache.len(), 20);
        assert!(cache.contains(&0));
        assert!(!cache.contains(&1));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_counters() {
        let cache: BoundedCache<Vec<u8>, u64> = BoundedCache::new("tsid", 1 << 20);
        cache.put(b"a".to_vec(), 1);
        cache.put(b"a".to_vec(), 2);
        assert_eq!(cache.get(&b"a".to_vec()), Some(2));
        assert_eq!(cache.get(&b"b".to_vec()), None);
        let st = cache.stats();
        assert_eq!(st.requests, 2);
        assert_eq!(st.misses, 1);
        assert_eq!(st.collisions, 1);
        assert_eq!(st.entries, 1);
    }

    #[test]
    fn test_shed_and_reset() {
        let cache: BoundedCache<u64, u64> = BoundedCache::new("test", 1 << 20);
        for i in 0..10 {
            cache.put(i, i);
        }
        cache.shed(0.5);
        assert_eq!(cache.len(), 5);
        assert!(cache.contains(&9));
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().size_bytes, 0);
    }
}
