//! Tag filters
//!
//! A filter selects series by one label: `key="v"`, `key!="v"`,
//! `key=~"re"` or `key!~"re"`. A series without the label behaves as if
//! it had the empty value, so `host=""` selects series without `host`
//! and `host!=""` selects series that have it. Regexes are anchored.

use crate::index::tag_index::{normalize_key, TagIndex};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::metric_name::{MetricName, METRIC_NAME_LABEL};
use regex::Regex;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One label condition of a search
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagFilter {
    /// Label name; empty or `__name__` for the metric group
    pub key: String,
    pub value: String,
    pub is_negative: bool,
    pub is_regexp: bool,
}

impl TagFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with(key, value, false, false)
    }

    pub fn neq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with(key, value, true, false)
    }

    pub fn regex(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with(key, value, false, true)
    }

    pub fn not_regex(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with(key, value, true, true)
    }

    /// Series having the label with any non-empty value
    pub fn exists(key: impl Into<String>) -> Self {
        Self::with(key, ".+", false, true)
    }

    /// Filter on the metric group
    pub fn metric(name: impl Into<String>) -> Self {
        Self::eq(METRIC_NAME_LABEL, name)
    }

    fn with(key: impl Into<String>, value: impl Into<String>, is_negative: bool, is_regexp: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_negative,
            is_regexp,
        }
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match (self.is_negative, self.is_regexp) {
            (false, false) => "=",
            (true, false) => "!=",
            (false, true) => "=~",
            (true, true) => "!~",
        };
        write!(f, "{}{}{:?}", normalize_key(&self.key), op, self.value)
    }
}

#[derive(Debug)]
enum ValueMatcher {
    Exact(String),
    /// Regex made only of literal alternatives, e.g. `a|b|c`
    Alternatives(Vec<String>),
    Regex(Regex),
}

impl ValueMatcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            ValueMatcher::Exact(v) => v == value,
            ValueMatcher::Alternatives(vs) => vs.iter().any(|v| v == value),
            ValueMatcher::Regex(re) => re.is_match(value),
        }
    }
}

/// A filter ready for evaluation
#[derive(Debug)]
pub(crate) struct CompiledFilter {
    pub key: String,
    pub is_negative: bool,
    pub is_regexp: bool,
    matcher: ValueMatcher,
    /// The value matcher accepts the empty value, i.e. missing labels
    matches_empty: bool,
    text: String,
}

/// Series selected by one filter: `ids`, or everything except `ids`
#[derive(Debug)]
pub(crate) struct FilterSet {
    pub ids: RoaringTreemap,
    pub complement: bool,
}

fn is_literal(s: &str) -> bool {
    !s.chars().any(|c| "\\.+*?()[]{}^$|".contains(c))
}

impl CompiledFilter {
    pub fn compile(filter: &TagFilter) -> StorageResult<Self> {
        let matcher = if !filter.is_regexp {
            ValueMatcher::Exact(filter.value.clone())
        } else if is_literal(&filter.value) {
            ValueMatcher::Exact(filter.value.clone())
        } else if filter.value.split('|').all(|alt| !alt.is_empty() && is_literal(alt)) {
            ValueMatcher::Alternatives(filter.value.split('|').map(String::from).collect())
        } else {
            let re = Regex::new(&format!("^(?:{})$", filter.value))
                .map_err(|e| StorageError::InvalidFilter(format!("{}: {}", filter, e)))?;
            ValueMatcher::Regex(re)
        };
        let matches_empty = matcher.matches("");
        Ok(Self {
            key: normalize_key(&filter.key).to_string(),
            is_negative: filter.is_negative,
            is_regexp: filter.is_regexp,
            matcher,
            matches_empty,
            text: filter.to_string(),
        })
    }

    /// True if the filter selects the given label value; `None` is a
    /// missing label
    pub fn matches_value(&self, value: Option<&str>) -> bool {
        let hit = match value {
            Some(v) => self.matcher.matches(v),
            None => self.matches_empty,
        };
        hit != self.is_negative
    }

    /// Evaluate against a full metric name
    pub fn matches(&self, mn: &MetricName) -> bool {
        self.matches_value(mn.label_value(&self.key))
    }

    /// Exact filters that require the label to have one specific value
    pub fn is_exact_positive(&self) -> bool {
        !self.is_negative && !self.matches_empty && matches!(self.matcher, ValueMatcher::Exact(_))
    }

    /// Postings cost of evaluating without enumerating values
    pub fn exact_postings_len(&self, index: &TagIndex) -> Option<u64> {
        match &self.matcher {
            ValueMatcher::Exact(v) if !self.matches_empty => {
                Some(index.postings(&self.key, v).map(|ids| ids.len()).unwrap_or(0))
            }
            _ => None,
        }
    }

    /// Resolve the filter through the inverted index
    pub fn evaluate(&self, index: &TagIndex) -> FilterSet {
        if !self.matches_empty {
            let ids = match &self.matcher {
                ValueMatcher::Exact(v) => index.postings(&self.key, v).cloned().unwrap_or_default(),
                ValueMatcher::Alternatives(vs) => {
                    let mut out = RoaringTreemap::new();
                    for v in vs {
                        if let Some(ids) = index.postings(&self.key, v) {
                            out |= ids;
                        }
                    }
                    out
                }
                ValueMatcher::Regex(re) => index.union_matching(&self.key, |v| re.is_match(v)),
            };
            FilterSet {
                ids,
                complement: self.is_negative,
            }
        } else {
            // Selected values include the missing label, so resolve the
            // values that are not selected and flip.
            let ids = index.union_matching(&self.key, |v| !self.matcher.matches(v));
            FilterSet {
                ids,
                complement: !self.is_negative,
            }
        }
    }

    /// Canonical text, used in cache keys
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(host: Option<&str>) -> MetricName {
        let mn = MetricName::new("cpu", vec![]);
        match host {
            Some(h) => mn.tag("host", h),
            None => mn,
        }
    }

    #[test]
    fn test_empty_value_semantics() {
        let missing = CompiledFilter::compile(&TagFilter::eq("host", "")).unwrap();
        assert!(missing.matches(&series(None)));
        assert!(!missing.matches(&series(Some("a"))));

        let present = CompiledFilter::compile(&TagFilter::neq("host", "")).unwrap();
        assert!(!present.matches(&series(None)));
        assert!(present.matches(&series(Some("a"))));

        let any = CompiledFilter::compile(&TagFilter::regex("host", ".*")).unwrap();
        assert!(any.matches(&series(None)));
        assert!(any.matches(&series(Some("a"))));
    }

    #[test]
    fn test_regex_is_anchored() {
        let f = CompiledFilter::compile(&TagFilter::regex("host", "web-[0-9]")).unwrap();
        assert!(f.matches(&series(Some("web-1"))));
        assert!(!f.matches(&series(Some("xweb-1"))));
        assert!(!f.matches(&series(Some("web-12"))));

        let n = CompiledFilter::compile(&TagFilter::not_regex("host", "web-.*")).unwrap();
        assert!(n.matches(&series(Some("db-1"))));
        assert!(n.matches(&series(None)));
    }

    #[test]
    fn test_literal_alternatives() {
        let f = CompiledFilter::compile(&TagFilter::regex("host", "a|b")).unwrap();
        assert!(matches!(f.matcher, ValueMatcher::Alternatives(_)));
        assert!(f.matches(&series(Some("b"))));
        assert!(!f.matches(&series(Some("ab"))));
    }

    #[test]
    fn test_evaluate_against_index() {
        let mut index = TagIndex::new();
        index.add(&series(Some("a")), 1);
        index.add(&series(Some("b")), 2);
        index.add(&series(None), 3);

        let set = CompiledFilter::compile(&TagFilter::eq("host", "a")).unwrap().evaluate(&index);
        assert!(!set.complement);
        assert_eq!(set.ids.iter().collect::<Vec<_>>(), vec![1]);

        // host!="a": everything except 1, including the series without host
        let set = CompiledFilter::compile(&TagFilter::neq("host", "a")).unwrap().evaluate(&index);
        assert!(set.complement);
        assert_eq!(set.ids.iter().collect::<Vec<_>>(), vec![1]);

        // host="": everything except series that have some host
        let set = CompiledFilter::compile(&TagFilter::eq("host", "")).unwrap().evaluate(&index);
        assert!(set.complement);
        assert_eq!(set.ids.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_invalid_regex() {
        let err = CompiledFilter::compile(&TagFilter::regex("host", "(")).unwrap_err();
        assert!(matches!(err, StorageError::InvalidFilter(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(TagFilter::metric("cpu").to_string(), "__name__=\"cpu\"");
        assert_eq!(TagFilter::not_regex("", "x.*").to_string(), "__name__!~\"x.*\"");
    }
}
