//! Per-day index: date → metric IDs with samples on that date
//!
//! Searches over short time ranges start from the union of the days they
//! touch instead of every registered series.

use roaring::RoaringTreemap;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct DateIndex {
    dates: BTreeMap<u64, RoaringTreemap>,
}

impl DateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the pair was not present
    pub fn add(&mut self, date: u64, metric_id: u64) -> bool {
        self.dates.entry(date).or_default().insert(metric_id)
    }

    /// Merge a whole set for one date
    pub fn add_set(&mut self, date: u64, ids: RoaringTreemap) {
        *self.dates.entry(date).or_default() |= ids;
    }

    pub fn contains(&self, date: u64, metric_id: u64) -> bool {
        self.dates
            .get(&date)
            .map(|ids| ids.contains(metric_id))
            .unwrap_or(false)
    }

    /// Metric IDs with samples on any day in `[min_date, max_date]`
    pub fn union_range(&self, min_date: u64, max_date: u64) -> RoaringTreemap {
        let mut out = RoaringTreemap::new();
        for ids in self.dates.range(min_date..=max_date).map(|(_, ids)| ids) {
            out |= ids;
        }
        out
    }

    /// Remove every day before `min_date`; returns the number of days dropped
    pub fn drop_before(&mut self, min_date: u64) -> usize {
        let keep = self.dates.split_off(&min_date);
        let dropped = self.dates.len();
        self.dates = keep;
        dropped
    }

    /// Remove IDs from every day
    pub fn remove_ids(&mut self, ids: &RoaringTreemap) {
        for set in self.dates.values_mut() {
            *set -= ids;
        }
        self.dates.retain(|_, set| !set.is_empty());
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &RoaringTreemap)> {
        self.dates.iter().map(|(d, ids)| (*d, ids))
    }

    pub fn days(&self) -> usize {
        self.dates.len()
    }

    /// Total (date, metric ID) pairs
    pub fn entries(&self) -> u64 {
        self.dates.values().map(|ids| ids.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_range() {
        let mut index = DateIndex::new();
        assert!(index.add(10, 1));
        assert!(!index.add(10, 1));
        index.add(11, 2);
        index.add(13, 3);

        let ids = index.union_range(10, 11);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(index.union_range(12, 12).is_empty());
        assert_eq!(index.entries(), 3);
    }

    #[test]
    fn test_drop_before_and_remove() {
        let mut index = DateIndex::new();
        for d in 0..10 {
            index.add(d, d);
        }
        assert_eq!(index.drop_before(7), 7);
        assert_eq!(index.days(), 3);
        assert!(!index.contains(6, 6));

        let mut gone = RoaringTreemap::new();
        gone.insert(8);
        index.remove_ids(&gone);
        assert_eq!(index.days(), 2);
    }
}
