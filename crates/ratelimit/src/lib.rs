//! Sliding-window rate limiting, fail-open.
//!
//! [`RateLimiter::check_limit`] never returns an error: when the backing
//! [`WindowStore`] is unreachable the request is allowed and the failure is
//! logged.

pub mod memory;
pub mod redis_store;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use visage_core::config::RateLimitConfig;
use visage_core::{duration_millis, now_millis};

pub use memory::MemoryWindowStore;
pub use redis_store::RedisWindowStore;
pub use store::{WindowOutcome, WindowStore, WindowStoreError};

pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later";
const KEY_PREFIX: &str = "ratelimit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: u32,
    pub message: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(60_000),
            max_requests: 100,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }
}

impl RateLimitSettings {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window(),
            max_requests: config.max_requests,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u32,
        remaining: u32,
        /// Time until the oldest counted request leaves the window.
        reset_after_ms: i64,
    },
    Rejected {
        limit: u32,
        retry_after_secs: u64,
        reset_after_ms: i64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// `X-RateLimit-*` response headers, plus `Retry-After` on rejection.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let reset_secs = |ms: i64| ((ms.max(0) as u64) + 999) / 1000;
        match *self {
            Decision::Allowed {
                limit,
                remaining,
                reset_after_ms,
            } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", remaining.to_string()),
                ("X-RateLimit-Reset", reset_secs(reset_after_ms).to_string()),
            ],
            Decision::Rejected {
                limit,
                retry_after_secs,
                reset_after_ms,
            } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", reset_secs(reset_after_ms).to_string()),
                ("Retry-After", retry_after_secs.to_string()),
            ],
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Whether the window store answers. Checks keep failing open either way.
    pub async fn store_reachable(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "rate limit store ping failed");
                false
            }
        }
    }

    pub async fn check_limit(&self, identifier: &str) -> Decision {
        self.check_limit_at(identifier, now_millis()).await
    }

    pub async fn check_limit_at(&self, identifier: &str, now_ms: i64) -> Decision {
        let window_ms = duration_millis(self.settings.window);
        let limit = self.settings.max_requests;
        let key = format!("{}:{}", KEY_PREFIX, identifier);

        let outcome = match self.store.hit(&key, now_ms, window_ms, limit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    store = self.store.name(),
                    identifier,
                    error = %e,
                    "rate limit store unavailable, allowing request"
                );
                return Decision::Allowed {
                    limit,
                    remaining: limit,
                    reset_after_ms: window_ms,
                };
            }
        };

        let oldest = outcome.oldest_ms.unwrap_or(now_ms);
        let reset_after_ms = oldest
            .saturating_add(window_ms)
            .saturating_sub(now_ms)
            .clamp(0, window_ms);

        if outcome.recorded {
            Decision::Allowed {
                limit,
                remaining: limit.saturating_sub(outcome.count + 1),
                reset_after_ms,
            }
        } else {
            let window_secs = ((window_ms as u64) + 999) / 1000;
            let retry_after_secs = (((reset_after_ms as u64) + 999) / 1000).clamp(1, window_secs.max(1));
            Decision::Rejected {
                limit,
                retry_after_secs,
                reset_after_ms,
            }
        }
    }
}
