//! Admin Routes
//!
//! - POST /api/v1/admin/tsdb/delete_series?match[]=... - Delete series
//! - GET /snapshot/create, /snapshot/list, /snapshot/delete?snapshot=..., /snapshot/delete_all
//! - GET /internal/force_flush - Write pending rows to parts
//! - GET /internal/force_merge?partition_prefix=... - Merge partitions
//! - GET /internal/stats - Storage statistics

use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{ApiResponse, DeleteResponse, ForceMergeResponse, RequestParams, SnapshotResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::blocking;
use crate::api::state::AppState;
use crate::storage::StorageStats;

/// POST /api/v1/admin/tsdb/delete_series
pub async fn delete_series(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ApiResponse<DeleteResponse>>> {
    let params = RequestParams::from_pairs(pairs)?;
    let filter_sets = params.required_filter_sets()?;
    let storage = state.storage.clone();
    let deleted = blocking(move || {
        let mut deleted = 0;
        for filters in &filter_sets {
            deleted += storage.delete_series(filters)?;
        }
        Ok(deleted)
    })
    .await?;
    tracing::info!(series = deleted, "Deleted series");
    Ok(Json(ApiResponse::success(DeleteResponse {
        deleted_series: deleted,
    })))
}

/// GET /snapshot/create
pub async fn create_snapshot(State(state): State<Arc<AppState>>) -> ApiResult<Json<ApiResponse<SnapshotResponse>>> {
    let storage = state.storage.clone();
    let snapshot = blocking(move || Ok(storage.create_snapshot()?)).await?;
    Ok(Json(ApiResponse::success(SnapshotResponse { snapshot })))
}

/// GET /snapshot/list
pub async fn list_snapshots(State(state): State<Arc<AppState>>) -> ApiResult<Json<ApiResponse<Vec<String>>>> {
    let storage = state.storage.clone();
    let names = blocking(move || Ok(storage.list_snapshots()?)).await?;
    Ok(Json(ApiResponse::success(names)))
}

/// GET /snapshot/delete?snapshot=NAME
pub async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ApiResponse<SnapshotResponse>>> {
    let params = RequestParams::from_pairs(pairs)?;
    let name = params
        .snapshot
        .ok_or_else(|| ApiError::Validation("missing snapshot parameter".into()))?;
    let storage = state.storage.clone();
    let snapshot = name.clone();
    blocking(move || Ok(storage.delete_snapshot(&name)?)).await?;
    Ok(Json(ApiResponse::success(SnapshotResponse { snapshot })))
}

/// GET /snapshot/delete_all
pub async fn delete_all_snapshots(State(state): State<Arc<AppState>>) -> ApiResult<Json<ApiResponse<Vec<String>>>> {
    let storage = state.storage.clone();
    let deleted = blocking(move || {
        let names = storage.list_snapshots()?;
        for name in &names {
            storage.delete_snapshot(name)?;
        }
        Ok(names)
    })
    .await?;
    Ok(Json(ApiResponse::success(deleted)))
}

/// GET /internal/force_flush
pub async fn force_flush(State(state): State<Arc<AppState>>) -> ApiResult<Json<ApiResponse<&'static str>>> {
    let storage = state.storage.clone();
    blocking(move || Ok(storage.force_flush()?)).await?;
    Ok(Json(ApiResponse::success("ok")))
}

/// GET /internal/force_merge
pub async fn force_merge(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ApiResponse<ForceMergeResponse>>> {
    let params = RequestParams::from_pairs(pairs)?;
    let prefix = params.partition_prefix.unwrap_or_default();
    let storage = state.storage.clone();
    let merged = blocking(move || Ok(storage.force_merge(&prefix)?)).await?;
    Ok(Json(ApiResponse::success(ForceMergeResponse {
        merged_partitions: merged,
    })))
}

/// GET /internal/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<ApiResponse<StorageStats>>> {
    let storage = state.storage.clone();
    let stats = blocking(move || Ok(storage.stats())).await?;
    Ok(Json(ApiResponse::success(stats)))
}
