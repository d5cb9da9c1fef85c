//! Tag Index - Inverted index from label pairs to metric IDs
//!
//! Maps `name → value → {metric IDs}`. Both levels are ordered maps so
//! label enumeration is deterministic and truncation at a limit always
//! keeps the same prefix. The metric group is indexed under `__name__`.
//!
//! # Example
//! ```ignore
//! // cpu{host="a"} and cpu{host="b"} registered as 1 and 2
//! tag_index.postings("host", "a");      // {1}
//! tag_index.postings("__name__", "cpu"); // {1, 2}
//! ```

use crate::storage::metric_name::{MetricName, METRIC_NAME_LABEL};
use roaring::RoaringTreemap;
use std::collections::BTreeMap;

/// Inverted index over label pairs
#[derive(Debug, Default)]
pub struct TagIndex {
    postings: BTreeMap<String, BTreeMap<String, RoaringTreemap>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every label of `mn` for `metric_id`
    pub fn add(&mut self, mn: &MetricName, metric_id: u64) {
        if !mn.metric_group.is_empty() {
            self.add_pair(METRIC_NAME_LABEL, &mn.metric_group, metric_id);
        }
        for t in &mn.tags {
            self.add_pair(&t.key, &t.value, metric_id);
        }
    }

    fn add_pair(&mut self, key: &str, value: &str, metric_id: u64) {
        if !self.postings.contains_key(key) {
            self.postings.insert(key.to_string(), BTreeMap::new());
        }
        let Some(values) = self.postings.get_mut(key) else {
            return;
        };
        if let Some(ids) = values.get_mut(value) {
            ids.insert(metric_id);
            return;
        }
        let mut ids = RoaringTreemap::new();
        ids.insert(metric_id);
        values.insert(value.to_string(), ids);
    }

    /// Remove every label of `mn` for `metric_id`, dropping empty entries
    pub fn remove(&mut self, mn: &MetricName, metric_id: u64) {
        let group = (!mn.metric_group.is_empty())
            .then(|| (METRIC_NAME_LABEL, mn.metric_group.as_str()));
        let tags = mn.tags.iter().map(|t| (t.key.as_str(), t.value.as_str()));
        for (key, value) in group.into_iter().chain(tags) {
            let Some(values) = self.postings.get_mut(key) else {
                continue;
            };
            if let Some(ids) = values.get_mut(value) {
                ids.remove(metric_id);
                if ids.is_empty() {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.postings.remove(key);
            }
        }
    }

    /// Metric IDs carrying `key=value`
    pub fn postings(&self, key: &str, value: &str) -> Option<&RoaringTreemap> {
        self.postings.get(normalize_key(key))?.get(value)
    }

    /// Values of `key` with their postings, in ascending value order
    pub fn values(&self, key: &str) -> impl Iterator<Item = (&str, &RoaringTreemap)> {
        self.postings
            .get(normalize_key(key))
            .into_iter()
            .flat_map(|v| v.iter().map(|(value, ids)| (value.as_str(), ids)))
    }

    /// Label names in ascending order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.postings.keys().map(|k| k.as_str())
    }

    /// Union of the postings of all values of `key` accepted by `pred`
    pub fn union_matching(&self, key: &str, mut pred: impl FnMut(&str) -> bool) -> RoaringTreemap {
        let mut out = RoaringTreemap::new();
        for (value, ids) in self.values(key) {
            if pred(value) {
                out |= ids;
            }
        }
        out
    }

    /// Number of values of `key`
    pub fn value_count(&self, key: &str) -> usize {
        self.postings.get(normalize_key(key)).map(|v| v.len()).unwrap_or(0)
    }

    /// Number of label names
    pub fn key_count(&self) -> usize {
        self.postings.len()
    }

    /// Number of distinct label pairs
    pub fn pair_count(&self) -> usize {
        self.postings.values().map(|v| v.len()).sum()
    }
}

/// The empty label name addresses the metric group
pub(crate) fn normalize_key(key: &str) -> &str {
    if key.is_empty() {
        METRIC_NAME_LABEL
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(host: &str) -> MetricName {
        MetricName::new("cpu", vec![]).tag("host", host)
    }

    #[test]
    fn test_add_and_lookup() {
        let mut index = TagIndex::new();
        index.add(&cpu("a"), 1);
        index.add(&cpu("b"), 2);

        assert_eq!(index.postings("host", "a").unwrap().len(), 1);
        assert_eq!(index.postings("__name__", "cpu").unwrap().len(), 2);
        assert_eq!(index.postings("", "cpu").unwrap().len(), 2);
        assert!(index.postings("host", "c").is_none());

        let keys: Vec<_> = index.keys().collect();
        assert_eq!(keys, vec!["__name__", "host"]);
        let values: Vec<_> = index.values("host").map(|(v, _)| v).collect();
        assert_eq!(values, vec!["a", "b"]);
        assert_eq!(index.pair_count(), 3);
    }

    #[test]
    fn test_union_matching() {
        let mut index = TagIndex::new();
        for (i, host) in ["web-1", "web-2", "db-1"].iter().enumerate() {
            index.add(&cpu(host), i as u64);
        }
        let web = index.union_matching("host", |v| v.starts_with("web"));
        assert_eq!(web.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_remove_drops_empty_entries() {
        let mut index = TagIndex::new();
        index.add(&cpu("a"), 1);
        index.add(&cpu("b"), 2);
        index.remove(&cpu("a"), 1);

        assert!(index.postings("host", "a").is_none());
        assert_eq!(index.value_count("host"), 1);
        index.remove(&cpu("b"), 2);
        assert_eq!(index.key_count(), 0);
    }
}
