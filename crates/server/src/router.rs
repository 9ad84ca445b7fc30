//! HTTP router construction.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::state::AppState;
use crate::{api, middleware};

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!(origin = %origin, error = %e, "invalid CORS origin, allowing any");
            CorsLayer::permissive()
        }
    }
}

/// Build the complete application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Layers run outside-in: the key check happens before a request is counted.
    let detect = Router::new()
        .route(
            "/api/detect/upload",
            post(api::upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/detect/status/", get(api::missing_task_id))
        .route("/api/detect/status/{task_id}", get(api::status))
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_api_key));

    Router::new()
        .route("/health", get(api::health))
        .merge(detect)
        .fallback(api::not_found)
        .layer(cors_layer(&state.cors_origin))
        .with_state(state)
}
