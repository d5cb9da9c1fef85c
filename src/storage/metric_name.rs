//! Canonical metric names
//!
//! A `MetricName` is the metric group plus tags sorted by key and unique
//! by key. The canonical marshaled form is used as the TSID cache key and
//! as the index key for name lookups, so two label sets that differ only
//! in order always marshal to the same bytes.
//!
//! Raw format (decoder output, any order):
//! ```text
//! repeat { key: varint len + bytes, value: varint len + bytes }
//! ```
//! Canonical format:
//! ```text
//! metric_group: varint len + bytes
//! repeat { key, value }   sorted by key
//! ```

use crate::encoding::{get_bytes, put_bytes};
use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label name holding the metric group
pub const METRIC_NAME_LABEL: &str = "__name__";

/// One label pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Limits applied to label sets at ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelLimits {
    pub max_labels_per_series: usize,
    pub max_label_name_len: usize,
    pub max_label_value_len: usize,
}

impl Default for LabelLimits {
    fn default() -> Self {
        Self {
            max_labels_per_series: 40,
            max_label_name_len: 256,
            max_label_value_len: 4 * 1024,
        }
    }
}

/// Canonical label set of one series
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricName {
    pub metric_group: String,
    /// Sorted by key, unique by key
    pub tags: Vec<Tag>,
}

impl MetricName {
    /// Create a canonical name from a group and tags in any order
    pub fn new(metric_group: impl Into<String>, tags: Vec<Tag>) -> Self {
        let mut mn = Self {
            metric_group: metric_group.into(),
            tags,
        };
        mn.canonicalize();
        mn
    }

    /// Builder method: add a tag, keeping the name canonical
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(key, value));
        self.canonicalize();
        self
    }

    /// Sort tags, drop empty values and keep the first occurrence of each key
    fn canonicalize(&mut self) {
        self.tags.retain(|t| !t.value.is_empty() && !t.key.is_empty());
        // stable sort so the first occurrence of a duplicated key wins
        self.tags.sort_by(|a, b| a.key.cmp(&b.key));
        self.tags.dedup_by(|b, a| a.key == b.key);
    }

    /// Value of a label; the empty key and `__name__` address the metric group
    pub fn label_value(&self, key: &str) -> Option<&str> {
        if key.is_empty() || key == METRIC_NAME_LABEL {
            return if self.metric_group.is_empty() {
                None
            } else {
                Some(&self.metric_group)
            };
        }
        self.tags
            .binary_search_by(|t| t.key.as_str().cmp(key))
            .ok()
            .map(|i| self.tags[i].value.as_str())
    }

    /// Marshal label pairs produced by a decoder, in any order
    pub fn marshal_raw<K, V>(labels: &[(K, V)]) -> Vec<u8>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut dst = Vec::with_capacity(labels.len() * 16);
        for (k, v) in labels {
            put_bytes(&mut dst, k.as_ref().as_bytes());
            put_bytes(&mut dst, v.as_ref().as_bytes());
        }
        dst
    }

    /// Parse raw label pairs into a canonical name
    pub fn from_raw(mut src: &[u8]) -> StorageResult<Self> {
        let mut metric_group = String::new();
        let mut tags = Vec::new();
        while !src.is_empty() {
            let (key, rest) = get_bytes(src)?;
            let (value, rest) = get_bytes(rest)?;
            src = rest;
            let key = utf8(key)?;
            let value = utf8(value)?;
            if key.is_empty() || key == METRIC_NAME_LABEL {
                if metric_group.is_empty() {
                    metric_group = value;
                }
            } else {
                tags.push(Tag { key, value });
            }
        }
        Ok(Self::new(metric_group, tags))
    }

    /// Canonical byte form
    pub fn marshal(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(self.metric_group.len() + self.tags.len() * 16 + 1);
        put_bytes(&mut dst, self.metric_group.as_bytes());
        for t in &self.tags {
            put_bytes(&mut dst, t.key.as_bytes());
            put_bytes(&mut dst, t.value.as_bytes());
        }
        dst
    }

    /// Parse the canonical byte form
    pub fn unmarshal(src: &[u8]) -> StorageResult<Self> {
        let (group, mut src) = get_bytes(src)?;
        let metric_group = utf8(group)?;
        let mut tags = Vec::new();
        while !src.is_empty() {
            let (key, rest) = get_bytes(src)?;
            let (value, rest) = get_bytes(rest)?;
            src = rest;
            tags.push(Tag {
                key: utf8(key)?,
                value: utf8(value)?,
            });
        }
        Ok(Self::new(metric_group, tags))
    }

    /// Check label count and sizes; returns the violated limit
    pub fn check_limits(&self, limits: &LabelLimits) -> Result<(), String> {
        if self.metric_group.is_empty() && self.tags.is_empty() {
            return Err("empty label set".into());
        }
        let labels = self.tags.len() + usize::from(!self.metric_group.is_empty());
        if labels > limits.max_labels_per_series {
            return Err(format!(
                "{} labels exceed the limit of {}",
                labels, limits.max_labels_per_series
            ));
        }
        if self.metric_group.len() > limits.max_label_value_len {
            return Err(format!(
                "metric name of {} bytes exceeds the limit of {}",
                self.metric_group.len(),
                limits.max_label_value_len
            ));
        }
        for t in &self.tags {
            if t.key.len() > limits.max_label_name_len {
                return Err(format!(
                    "label name of {} bytes exceeds the limit of {}",
                    t.key.len(),
                    limits.max_label_name_len
                ));
            }
            if t.value.len() > limits.max_label_value_len {
                return Err(format!(
                    "value of label {:?} with {} bytes exceeds the limit of {}",
                    t.key,
                    t.value.len(),
                    limits.max_label_value_len
                ));
            }
        }
        Ok(())
    }

    /// All labels as pairs, `__name__` first
    pub fn labels(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.tags.len() + 1);
        if !self.metric_group.is_empty() {
            out.push((METRIC_NAME_LABEL.to_string(), self.metric_group.clone()));
        }
        out.extend(self.tags.iter().map(|t| (t.key.clone(), t.value.clone())));
        out
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.metric_group)?;
        for (i, t) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={:?}", t.key, t.value)?;
        }
        write!(f, "}}")
    }
}

fn utf8(b: &[u8]) -> StorageResult<String> {
    String::from_utf8(b.to_vec())
        .map_err(|e| StorageError::InvalidMetricName(format!("label is not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_is_canonicalized() {
        let a = MetricName::marshal_raw(&[("host", "a"), ("__name__", "cpu"), ("dc", "eu")]);
        let b = MetricName::marshal_raw(&[("dc", "eu"), ("host", "a"), ("__name__", "cpu")]);
        let ma = MetricName::from_raw(&a).unwrap();
        let mb = MetricName::from_raw(&b).unwrap();
        assert_eq!(ma, mb);
        assert_eq!(ma.marshal(), mb.marshal());
        assert_eq!(ma.metric_group, "cpu");
        assert_eq!(ma.tags[0].key, "dc");
        assert_eq!(ma.to_string(), r#"cpu{dc="eu",host="a"}"#);
    }

    #[test]
    fn test_duplicates_and_empty_values() {
        let raw = MetricName::marshal_raw(&[
            ("__name__", "up"),
            ("job", "a"),
            ("job", "b"),
            ("empty", ""),
        ]);
        let mn = MetricName::from_raw(&raw).unwrap();
        assert_eq!(mn.tags, vec![Tag::new("job", "a")]);
        assert_eq!(mn.label_value("job"), Some("a"));
        assert_eq!(mn.label_value("__name__"), Some("up"));
        assert_eq!(mn.label_value("empty"), None);
    }

    #[test]
    fn test_canonical_round_trip() {
        let mn = MetricName::new("cpu", vec![]).tag("z", "1").tag("a", "2");
        assert_eq!(MetricName::unmarshal(&mn.marshal()).unwrap(), mn);
    }

    #[test]
    fn test_limits() {
        let limits = LabelLimits {
            max_labels_per_series: 2,
            max_label_name_len: 4,
            max_label_value_len: 8,
        };
        assert!(MetricName::new("cpu", vec![]).tag("host", "a").check_limits(&limits).is_ok());
        assert!(MetricName::new("cpu", vec![])
            .tag("host", "a")
            .tag("dc", "b")
            .check_limits(&limits)
            .is_err());
        assert!(MetricName::new("cpu", vec![]).tag("hostname", "a").check_limits(&limits).is_err());
        assert!(MetricName::new("cpu", vec![]).tag("h", "123456789").check_limits(&limits).is_err());
        assert!(MetricName::default().check_limits(&limits).is_err());
    }

    #[test]
    fn test_truncated_raw_rejected() {
        let mut raw = MetricName::marshal_raw(&[("__name__", "cpu")]);
        raw.pop();
        assert!(MetricName::from_raw(&raw).is_err());
    }
}
