use std::sync::Arc;

use visage_core::config::AuthConfig;
use visage_queue::ConsumerMetrics;
use visage_ratelimit::RateLimiter;

use crate::service::TaskService;

pub struct AppState {
    pub service: Arc<TaskService>,
    pub limiter: Arc<RateLimiter>,
    pub auth: AuthConfig,
    /// `*` allows any origin.
    pub cors_origin: String,
    /// Present when this process runs the worker pool.
    pub workers: Option<Arc<ConsumerMetrics>>,
}
