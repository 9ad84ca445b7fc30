//! Liveness and operational counters.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use visage_queue::{ConsumerSnapshot, QueueCounts, WorkQueue};
use visage_store::TaskStore;

use crate::state::AppState;

pub const SERVICE_NAME: &str = "Human Detection API";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub service: &'static str,
    pub version: &'static str,
    pub task_store: &'static str,
    pub rate_limiter: &'static str,
    pub rate_limiter_reachable: bool,
    pub queue: Option<QueueCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<ConsumerSnapshot>,
}

/// GET /health. Reports `degraded` when queue counts cannot be read or the
/// rate limit store does not answer.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let queue = match state.service.queue().counts().await {
        Ok(counts) => Some(counts),
        Err(e) => {
            warn!(error = %e, "health check could not read queue counts");
            None
        }
    };

    let rate_limiter_reachable = state.limiter.store_reachable().await;

    Json(HealthResponse {
        status: if queue.is_some() && rate_limiter_reachable { "ok" } else { "degraded" },
        timestamp: Utc::now().to_rfc3339(),
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        task_store: state.service.tasks().name(),
        rate_limiter: state.limiter.store_name(),
        rate_limiter_reachable,
        queue,
        workers: state.workers.as_ref().map(|m| m.snapshot()),
    })
}
