//! Export Routes
//!
//! Data export endpoint for backup and analysis.
//!
//! - GET /api/v1/export?match[]=...&start=...&end=...&format=jsonl|csv
//!
//! The output of `jsonl` and `csv` can be fed back to the import routes.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::sync::Arc;

use crate::api::dto::RequestParams;
use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::{blocking, now_ms, search_context};
use crate::api::state::AppState;
use crate::index::TagFilter;
use crate::ingest::{csv, jsonl, ImportFormat, ImportResult};
use crate::storage::{SearchContext, Series, StorageEngine, TimeRange};

/// GET /api/v1/export
pub async fn export_data(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Response> {
    if !state.config.enable_export {
        return Err(ApiError::NotFound("export is disabled".to_string()));
    }
    let params = RequestParams::from_pairs(pairs)?;
    let filter_sets = params.required_filter_sets()?;
    let tr = params.time_range(now_ms())?;
    let format: ImportFormat = params.format.as_deref().unwrap_or("jsonl").parse()?;

    let _permit = state.search_limiter.acquire().await?;
    let storage = state.storage.clone();
    let ctx = search_context(&storage);
    let body = blocking(move || export_series(&storage, &filter_sets, &tr, format, ctx)).await?;

    let content_type = match format {
        ImportFormat::JsonLines => "application/x-ndjson",
        ImportFormat::Csv => "text/csv",
    };
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, content_type)], Body::from(body)).into_response())
}

/// Series matching any of the filter sets, each written once
pub fn export_series(
    storage: &StorageEngine,
    filter_sets: &[Vec<TagFilter>],
    tr: &TimeRange,
    format: ImportFormat,
    ctx: SearchContext,
) -> ApiResult<Vec<u8>> {
    match format {
        ImportFormat::JsonLines => {
            let mut out = Vec::new();
            for_each_series(storage, filter_sets, tr, ctx, |s| jsonl::write_series(&mut out, s))?;
            Ok(out)
        }
        ImportFormat::Csv => {
            let mut w = ::csv::Writer::from_writer(Vec::new());
            for_each_series(storage, filter_sets, tr, ctx, |s| csv::write_series(&mut w, s))?;
            w.into_inner()
                .map_err(|e| ApiError::Internal(format!("cannot finish CSV output: {}", e)))
        }
    }
}

fn for_each_series(
    storage: &StorageEngine,
    filter_sets: &[Vec<TagFilter>],
    tr: &TimeRange,
    ctx: SearchContext,
    mut f: impl FnMut(&Series) -> ImportResult<()>,
) -> ApiResult<()> {
    let mut seen = HashSet::new();
    for filters in filter_sets {
        for series in storage.search(filters, tr, ctx.clone())? {
            let series = series?;
            if seen.insert(series.tsid.metric_id) {
                f(&series)?;
            }
        }
    }
    Ok(())
}
