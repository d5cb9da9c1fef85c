//! Label and Series Routes
//!
//! - GET /api/v1/labels - Label names
//! - GET /api/v1/label/:name/values - Values of one label
//! - GET /api/v1/series - Label sets of matching series
//! - GET /api/v1/series/count - Number of live series
//! - GET /api/v1/status/tag_entries - Label names with their values

use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::api::dto::{ApiResponse, RequestParams};
use crate::api::error::ApiResult;
use crate::api::routes::{blocking, now_ms};
use crate::api::state::AppState;
use crate::index::{TagEntry, TagFilter, Truncated};
use crate::storage::StorageResult;

/// Union of per-selector enumerations, still sorted and capped
fn union_limited(
    filter_sets: Vec<Vec<TagFilter>>,
    limit: usize,
    mut search: impl FnMut(&[TagFilter]) -> StorageResult<Truncated<String>>,
) -> StorageResult<Truncated<String>> {
    let sets = if filter_sets.is_empty() { vec![Vec::new()] } else { filter_sets };
    let mut items = BTreeSet::new();
    let mut truncated = false;
    for filters in &sets {
        let found = search(filters)?;
        truncated |= found.truncated;
        items.extend(found.items);
    }
    if items.len() > limit {
        truncated = true;
    }
    Ok(Truncated {
        items: items.into_iter().take(limit).collect(),
        truncated,
    })
}

/// GET /api/v1/labels
pub async fn label_names(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ApiResponse<Vec<String>>>> {
    let params = RequestParams::from_pairs(pairs)?;
    let filter_sets = params.filter_sets()?;
    let tr = params.time_range(now_ms())?;
    let _permit = state.search_limiter.acquire().await?;
    let storage = state.storage.clone();
    let limit = params.limit.unwrap_or(storage.config().search.max_tag_keys);
    let names = blocking(move || {
        Ok(union_limited(filter_sets, limit, |f| storage.search_label_names(f, &tr, limit))?)
    })
    .await?;
    Ok(Json(ApiResponse::truncated(names.items, names.truncated)))
}

/// GET /api/v1/label/:name/values
pub async fn label_values(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ApiResponse<Vec<String>>>> {
    let params = RequestParams::from_pairs(pairs)?;
    let filter_sets = params.filter_sets()?;
    let tr = params.time_range(now_ms())?;
    let _permit = state.search_limiter.acquire().await?;
    let storage = state.storage.clone();
    let limit = params.limit.unwrap_or(storage.config().search.max_tag_values);
    let values = blocking(move || {
        Ok(union_limited(filter_sets, limit, |f| {
            storage.search_label_values(&name, f, &tr, limit)
        })?)
    })
    .await?;
    Ok(Json(ApiResponse::truncated(values.items, values.truncated)))
}

/// GET /api/v1/series
pub async fn series(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ApiResponse<Vec<BTreeMap<String, String>>>>> {
    let params = RequestParams::from_pairs(pairs)?;
    let filter_sets = params.required_filter_sets()?;
    let tr = params.time_range(now_ms())?;
    let _permit = state.search_limiter.acquire().await?;
    let storage = state.storage.clone();
    let names: Vec<BTreeMap<String, String>> = blocking(move || {
        let mut out = BTreeSet::new();
        for filters in &filter_sets {
            for mn in storage.search_metric_names(filters, &tr)? {
                out.insert(mn.labels().into_iter().collect::<BTreeMap<_, _>>());
            }
        }
        Ok(out.into_iter().collect())
    })
    .await?;
    Ok(Json(ApiResponse::success(names)))
}

/// GET /api/v1/series/count
pub async fn series_count(State(state): State<Arc<AppState>>) -> ApiResult<Json<ApiResponse<Vec<u64>>>> {
    let storage = state.storage.clone();
    let count = blocking(move || Ok(storage.series_count())).await?;
    Ok(Json(ApiResponse::success(vec![count])))
}

/// GET /api/v1/status/tag_entries
pub async fn tag_entries(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ApiResponse<Vec<TagEntry>>>> {
    let params = RequestParams::from_pairs(pairs)?;
    let _permit = state.search_limiter.acquire().await?;
    let storage = state.storage.clone();
    let limit = params.limit.unwrap_or(usize::MAX);
    let entries = blocking(move || Ok(storage.search_tag_entries(limit, limit))).await?;
    Ok(Json(ApiResponse::truncated(entries.items, entries.truncated)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_limited() {
        let sets = vec![vec![TagFilter::metric("a")], vec![TagFilter::metric("b")]];
        let mut calls = 0;
        let out = union_limited(sets, 3, |f| {
            calls += 1;
            let items = if f[0].value == "a" {
                vec!["x".to_string(), "y".to_string()]
            } else {
                vec!["y".to_string(), "z".to_string(), "w".to_string()]
            };
            Ok(Truncated { items, truncated: false })
        })
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(out.items, vec!["w", "x", "y"]);
        assert!(out.truncated);
    }
}
