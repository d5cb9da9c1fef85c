//! Data Transfer Objects
//!
//! Request parameters and response bodies for the API endpoints.
//! Responses use the `{"status": "success", "data": ...}` envelope that
//! Prometheus-compatible clients expect.

use crate::api::error::{ApiError, ApiResult};
use crate::index::TagFilter;
use crate::query::{parse_selector, parse_time_range};
use crate::storage::TimeRange;
use serde::Serialize;

// ============================================
// REQUEST PARAMETERS
// ============================================

/// Query-string parameters shared by the read endpoints.
///
/// Built from raw pairs because `match[]` may repeat.
#[derive(Debug, Default, Clone)]
pub struct RequestParams {
    /// Series selectors from `match[]` (or `match`)
    pub matches: Vec<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
    pub format: Option<String>,
    /// Snapshot name for delete
    pub snapshot: Option<String>,
    pub partition_prefix: Option<String>,
}

impl RequestParams {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> ApiResult<Self> {
        let mut p = Self::default();
        for (k, v) in pairs {
            match k.as_str() {
                "match[]" | "match" => p.matches.push(v),
                "start" => p.start = Some(v),
                "end" => p.end = Some(v),
                "limit" => {
                    let limit = v
                        .parse::<usize>()
                        .map_err(|_| ApiError::Validation(format!("invalid limit {:?}", v)))?;
                    p.limit = Some(limit);
                }
                "format" => p.format = Some(v),
                "snapshot" => p.snapshot = Some(v),
                "partition_prefix" => p.partition_prefix = Some(v),
                _ => {}
            }
        }
        Ok(p)
    }

    /// One filter set per selector; empty when no selector was given
    pub fn filter_sets(&self) -> ApiResult<Vec<Vec<TagFilter>>> {
        self.matches
            .iter()
            .map(|m| parse_selector(m).map_err(ApiError::from))
            .collect()
    }

    /// Like [`filter_sets`](Self::filter_sets) but at least one selector is required
    pub fn required_filter_sets(&self) -> ApiResult<Vec<Vec<TagFilter>>> {
        if self.matches.is_empty() {
            return Err(ApiError::Validation("missing match[] parameter".into()));
        }
        self.filter_sets()
    }

    /// The requested range; all time when neither end is given
    pub fn time_range(&self, now_ms: i64) -> ApiResult<TimeRange> {
        if self.start.is_none() && self.end.is_none() {
            return Ok(TimeRange::all());
        }
        Ok(parse_time_range(self.start.as_deref(), self.end.as_deref(), now_ms)?)
    }
}

// ============================================
// RESPONSES
// ============================================

/// Standard success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub data: T,
    /// Set on enumerations cut short by a limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success",
            data,
            truncated: None,
        }
    }

    pub fn truncated(data: T, truncated: bool) -> Self {
        Self {
            status: "success",
            data,
            truncated: Some(truncated),
        }
    }
}

/// Delete series response
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted_series: u64,
}

/// Snapshot create response
#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub snapshot: String,
}

/// Force merge response
#[derive(Debug, Serialize)]
pub struct ForceMergeResponse {
    pub merged_partitions: usize,
}

// ============================================
// HEALTH
// ============================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy" or "unhealthy"
    pub status: String,
    /// Storage status: "ok" or "error"
    pub storage: String,
    pub series: u64,
    pub partitions: usize,
    pub parts: u64,
    pub pending_rows: u64,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Server version
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_repeated_match() {
        let p = RequestParams::from_pairs(pairs(&[
            ("match[]", "cpu"),
            ("match[]", r#"mem{host="a"}"#),
            ("limit", "5"),
        ]))
        .unwrap();
        assert_eq!(p.matches.len(), 2);
        assert_eq!(p.limit, Some(5));
        assert_eq!(p.filter_sets().unwrap()[1].len(), 2);
    }

    #[test]
    fn test_invalid_params() {
        assert!(RequestParams::from_pairs(pairs(&[("limit", "many")])).is_err());
        let p = RequestParams::from_pairs(pairs(&[("match[]", "cpu{")])).unwrap();
        assert!(p.filter_sets().is_err());
        assert!(RequestParams::default().required_filter_sets().is_err());
    }
}
