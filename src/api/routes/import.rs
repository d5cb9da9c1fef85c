//! Import Routes
//!
//! - POST /api/v1/import - JSON lines, one series per line
//! - POST /api/v1/import/csv - `selector,timestamp,value` records

use axum::{body::Bytes, extract::State, Json};
use std::io::Cursor;
use std::sync::Arc;

use crate::api::dto::ApiResponse;
use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::blocking;
use crate::api::state::AppState;
use crate::ingest::{ImportFormat, ImportStats};

/// POST /api/v1/import
pub async fn import_json_lines(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<ImportStats>>> {
    import(state, body, ImportFormat::JsonLines).await
}

/// POST /api/v1/import/csv
pub async fn import_csv(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<ImportStats>>> {
    import(state, body, ImportFormat::Csv).await
}

async fn import(
    state: Arc<AppState>,
    body: Bytes,
    format: ImportFormat,
) -> ApiResult<Json<ApiResponse<ImportStats>>> {
    let _permit = state.insert_limiter.acquire().await?;
    let importer = state.importer.clone();
    let stats = blocking(move || Ok(importer.import(Cursor::new(body), format)?)).await?;

    // nothing usable in the body at all
    if stats.rows_parsed == 0 && stats.parse_errors > 0 {
        return Err(ApiError::Validation(format!(
            "no rows could be parsed; first error: {}",
            stats.first_parse_error.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(Json(ApiResponse::success(stats)))
}
