//! Result retrieval endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tryon_common::{ErrorBody, ErrorResponse};

use crate::state::AppState;
use crate::store::StoreError;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/results/:result_id", get(get_result))
}

/// GET /results/{result_id} - The stored PNG, or 404.
async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(result_id): Path<String>,
) -> Response {
    let store = state.store.clone();
    let fetched = tokio::task::spawn_blocking(move || store.fetch(&result_id)).await;

    match fetched {
        Ok(Ok(artifact)) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, "private, max-age=3600"),
            ],
            artifact.png,
        )
            .into_response(),
        Ok(Err(StoreError::NotFound)) => error(StatusCode::NOT_FOUND, "not_found", "Result not found"),
        Ok(Err(e)) => {
            tracing::error!("Failed to read result: {}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "storage_failed", "Failed to read result")
        }
        Err(e) => {
            tracing::error!("Result fetch task failed: {}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "storage_failed", "Failed to read result")
        }
    }
}

fn error(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: ErrorBody {
            error_type: "result".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            field: None,
            correlation_id: None,
        },
    };
    (status, Json(body)).into_response()
}
