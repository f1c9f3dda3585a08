//! HTTP API.

pub mod health;
pub mod process;
pub mod results;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::logging::request_logger;
use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .merge(health::router())
        .merge(process::router())
        .merge(results::router())
}

/// Build the complete application with middleware and state attached.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.limits.max_request_bytes;

    router()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(request_logger))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET / - Service information.
async fn root() -> Json<Value> {
    Json(json!({
        "service": "tryon-server",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "process": "POST /process",
            "tryon": "POST /tryon",
            "results": "GET /results/{resultId}",
        },
    }))
}
