//! Request guards for the detection routes: shared-secret check, then the
//! per-key rate limit.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use visage_ratelimit::Decision;

use crate::api::{ApiError, ErrorCode};
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rate-limit identity for callers without a key.
pub const ANONYMOUS: &str = "anonymous";

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Reject requests without the configured `X-API-KEY`. A deployment with no
/// key configured lets everything through.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth.api_key.as_deref() else {
        return next.run(request).await;
    };

    let rejection = match presented_key(request.headers()) {
        None => Some(ErrorCode::MissingApiKey),
        Some(key) if key != expected => Some(ErrorCode::InvalidApiKey),
        Some(_) => None,
    };

    match rejection {
        Some(code) => {
            debug!(path = %request.uri().path(), code = code.as_str(), "request rejected");
            ApiError::new(code).into_response()
        }
        None => next.run(request).await,
    }
}

/// Count the request against the caller's window and attach
/// `X-RateLimit-*` headers to whatever comes back.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = presented_key(request.headers())
        .unwrap_or(ANONYMOUS)
        .to_string();
    let decision = state.limiter.check_limit(&identifier).await;

    let mut response = match &decision {
        Decision::Allowed { .. } => next.run(request).await,
        Decision::Rejected {
            retry_after_secs, ..
        } => {
            debug!(identifier = %identifier, retry_after_secs, "rate limit exceeded");
            ApiError::rate_limited(state.limiter.settings().message.clone(), *retry_after_secs)
                .into_response()
        }
    };
    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}
