//! Metric Index - forward mappings of registered series
//!
//! - marshaled metric name → TSID
//! - metric ID → metric name
//! - metric ID → TSID

use crate::storage::metric_name::MetricName;
use crate::storage::tsid::Tsid;
use roaring::RoaringTreemap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct MetricIndex {
    by_name: HashMap<Vec<u8>, Tsid>,
    names: HashMap<u64, Arc<MetricName>>,
    tsids: HashMap<u64, Tsid>,
    /// Every metric ID ever registered, including deleted ones
    all: RoaringTreemap,
    max_metric_id: u64,
}

impl MetricIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a series. `name_key` is the canonical marshaled name.
    ///
    /// The name → TSID entry is replaced only when `replace_name` is set,
    /// which callers use when the current owner of the name was deleted.
    pub fn insert(&mut self, name_key: Vec<u8>, mn: Arc<MetricName>, tsid: Tsid, replace_name: bool) {
        let metric_id = tsid.metric_id;
        if replace_name {
            self.by_name.insert(name_key, tsid);
        } else {
            self.by_name.entry(name_key).or_insert(tsid);
        }
        self.names.insert(metric_id, mn);
        self.tsids.insert(metric_id, tsid);
        self.all.insert(metric_id);
        self.max_metric_id = self.max_metric_id.max(metric_id);
    }

    /// Forget a series entirely; returns its name if it was known
    pub fn remove(&mut self, metric_id: u64) -> Option<Arc<MetricName>> {
        let mn = self.names.remove(&metric_id)?;
        self.tsids.remove(&metric_id);
        self.all.remove(metric_id);
        let key = mn.marshal();
        if self.by_name.get(&key).map(|t| t.metric_id) == Some(metric_id) {
            self.by_name.remove(&key);
        }
        Some(mn)
    }

    pub fn lookup(&self, name_key: &[u8]) -> Option<Tsid> {
        self.by_name.get(name_key).copied()
    }

    pub fn metric_name(&self, metric_id: u64) -> Option<&Arc<MetricName>> {
        self.names.get(&metric_id)
    }

    pub fn tsid(&self, metric_id: u64) -> Option<Tsid> {
        self.tsids.get(&metric_id).copied()
    }

    pub fn contains(&self, metric_id: u64) -> bool {
        self.tsids.contains_key(&metric_id)
    }

    pub fn all(&self) -> &RoaringTreemap {
        &self.all
    }

    /// Registered series, including deleted ones not yet collected
    pub fn len(&self) -> usize {
        self.tsids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tsids.is_empty()
    }

    /// Largest metric ID seen, 0 when empty
    pub fn max_metric_id(&self) -> u64 {
        self.max_metric_id
    }

    /// Every series as `(metric ID, TSID, name)`, in metric ID order
    pub fn iter(&self) -> impl Iterator<Item = (u64, Tsid, &Arc<MetricName>)> {
        self.all.iter().filter_map(move |id| {
            let tsid = self.tsids.get(&id)?;
            let mn = self.names.get(&id)?;
            Some((id, *tsid, mn))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(index: &mut MetricIndex, host: &str, id: u64, replace: bool) -> Tsid {
        let mn = MetricName::new("cpu", vec![]).tag("host", host);
        let tsid = Tsid::generate(&mn, id);
        index.insert(mn.marshal(), Arc::new(mn), tsid, replace);
        tsid
    }

    #[test]
    fn test_forward_mappings() {
        let mut index = MetricIndex::new();
        let tsid = register(&mut index, "a", 7, false);
        let key = MetricName::new("cpu", vec![]).tag("host", "a").marshal();

        assert_eq!(index.lookup(&key), Some(tsid));
        assert_eq!(index.tsid(7), Some(tsid));
        assert_eq!(index.metric_name(7).unwrap().label_value("host"), Some("a"));
        assert_eq!(index.max_metric_id(), 7);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_first_registration_wins_unless_replaced() {
        let mut index = MetricIndex::new();
        let key = MetricName::new("cpu", vec![]).tag("host", "a").marshal();
        let first = register(&mut index, "a", 1, false);
        register(&mut index, "a", 2, false);
        assert_eq!(index.lookup(&key), Some(first));

        let third = register(&mut index, "a", 3, true);
        assert_eq!(index.lookup(&key), Some(third));
    }

    #[test]
    fn test_remove() {
        let mut index = MetricIndex::new();
        register(&mut index, "a", 1, false);
        assert!(index.remove(1).is_some());
        assert!(index.remove(1).is_none());
        assert!(index.is_empty());
        assert!(!index.all().contains(1));
    }
}
