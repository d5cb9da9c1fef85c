//! API Routes
//!
//! Route handlers organized by functionality. Storage calls block, so
//! every handler runs them on the blocking thread pool.

pub mod admin;
pub mod export;
pub mod health;
pub mod import;
pub mod labels;

use crate::api::error::{ApiError, ApiResult};
use crate::storage::SearchContext;
use crate::storage::StorageEngine;

/// Run storage work off the async executor
pub(crate) async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("storage task failed: {}", e)))?
}

/// Search context bounded by the configured query duration
pub(crate) fn search_context(storage: &StorageEngine) -> SearchContext {
    SearchContext::with_timeout(storage.config().search.max_query_duration)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
