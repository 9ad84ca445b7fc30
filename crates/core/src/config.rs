use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub aws: AwsConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub detector: DetectorConfig,
    pub sweep: SweepConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `VISAGE_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("VISAGE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            storage: StorageConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            auth: AuthConfig::from_env_profiled(p),
            rate_limit: RateLimitConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p),
            detector: DetectorConfig::from_env_profiled(p),
            sweep: SweepConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:      {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  storage:     database={}, artifacts={}",
            self.storage.database_url.as_deref().map(redact_url).unwrap_or_else(|| "(memory)".into()),
            self.storage.artifact_location(),
        );
        tracing::info!("  auth:        api_key={}", if self.auth.is_configured() { "set" } else { "(none)" });
        tracing::info!(
            "  rate_limit:  {} req / {} ms, redis={}",
            self.rate_limit.max_requests,
            self.rate_limit.window_ms,
            self.rate_limit.redis_url.as_deref().map(redact_url).unwrap_or_else(|| "(memory)".into()),
        );
        tracing::info!(
            "  queue:       attempts={}, backoff={}ms, lock={}ms",
            self.queue.max_attempts,
            self.queue.backoff_ms,
            self.queue.lock_ms,
        );
        tracing::info!("  worker:      concurrency={}", self.worker.concurrency);
        tracing::info!("  detector:    url={}", self.detector.url);
        tracing::info!(
            "  sweep:       every {}s, max_age={}s",
            self.sweep.interval_secs,
            self.sweep.max_task_age_secs,
        );
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "VISAGE_HOST", "0.0.0.0"),
            port: profiled_env_parse(p, "VISAGE_PORT", 3000),
            cors_origin: profiled_env_or(p, "VISAGE_CORS_ORIGIN", "*"),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite URL for task records and the durable queue. Unset means
    /// everything lives in process memory.
    pub database_url: Option<String>,
    /// Local directory holding uploaded artifacts.
    pub artifact_dir: PathBuf,
    /// When set, artifacts go to this S3 bucket instead of `artifact_dir`.
    pub artifact_bucket: Option<String>,
    pub artifact_prefix: Option<String>,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            database_url: profiled_env_opt(p, "VISAGE_DATABASE_URL"),
            artifact_dir: PathBuf::from(profiled_env_or(p, "VISAGE_ARTIFACT_DIR", "public")),
            artifact_bucket: profiled_env_opt(p, "VISAGE_ARTIFACT_BUCKET"),
            artifact_prefix: profiled_env_opt(p, "VISAGE_ARTIFACT_PREFIX"),
        }
    }

    pub fn artifact_location(&self) -> String {
        match &self.artifact_bucket {
            Some(bucket) => format!(
                "s3://{}/{}",
                bucket,
                self.artifact_prefix.as_deref().unwrap_or("")
            ),
            None => self.artifact_dir.display().to_string(),
        }
    }
}

// ── AWS / S3 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }
}

// ── Auth ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret expected in the `X-API-KEY` header.
    pub api_key: Option<String>,
}

impl AuthConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            api_key: profiled_env_opt(p, "VISAGE_API_KEY"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

// ── Rate limiting ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    /// Shared window store; unset keeps windows in process memory.
    pub redis_url: Option<String>,
}

impl RateLimitConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            window_ms: profiled_env_parse(p, "VISAGE_RATE_LIMIT_WINDOW_MS", 60_000),
            max_requests: profiled_env_parse(p, "VISAGE_RATE_LIMIT_MAX", 100),
            redis_url: profiled_env_opt(p, "VISAGE_REDIS_URL"),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

// ── Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub backoff_ms: u64,
    /// How long a delivered job stays locked before it counts as stalled.
    pub lock_ms: u64,
    pub stalled_interval_ms: u64,
    pub max_stalled_count: u32,
    pub keep_completed: usize,
    pub keep_failed: usize,
    /// Idle poll interval when the queue is empty.
    pub poll_ms: u64,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_attempts: profiled_env_parse(p, "VISAGE_QUEUE_MAX_ATTEMPTS", 3),
            backoff_ms: profiled_env_parse(p, "VISAGE_QUEUE_BACKOFF_MS", 1_000),
            lock_ms: profiled_env_parse(p, "VISAGE_QUEUE_LOCK_MS", 300_000),
            stalled_interval_ms: profiled_env_parse(p, "VISAGE_QUEUE_STALLED_INTERVAL_MS", 30_000),
            max_stalled_count: profiled_env_parse(p, "VISAGE_QUEUE_MAX_STALLED", 1),
            keep_completed: profiled_env_parse(p, "VISAGE_QUEUE_KEEP_COMPLETED", 100),
            keep_failed: profiled_env_parse(p, "VISAGE_QUEUE_KEEP_FAILED", 100),
            poll_ms: profiled_env_parse(p, "VISAGE_QUEUE_POLL_MS", 500),
        }
    }
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            concurrency: profiled_env_parse(p, "VISAGE_WORKER_CONCURRENCY", 5).max(1),
        }
    }
}

// ── Detector ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Base URL of the inference sidecar.
    pub url: String,
    pub timeout_ms: u64,
    pub max_detected: u32,
    pub min_confidence: f32,
}

impl DetectorConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "VISAGE_DETECTOR_URL", "http://127.0.0.1:8500"),
            timeout_ms: profiled_env_parse(p, "VISAGE_DETECTOR_TIMEOUT_MS", 30_000),
            max_detected: profiled_env_parse(p, "VISAGE_DETECTOR_MAX_DETECTED", 20),
            min_confidence: profiled_env_parse(p, "VISAGE_DETECTOR_MIN_CONFIDENCE", 0.5),
        }
    }
}

// ── Expiry sweep ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub max_task_age_secs: u64,
}

impl SweepConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            interval_secs: profiled_env_parse(p, "VISAGE_SWEEP_INTERVAL_SECS", 3_600),
            max_task_age_secs: profiled_env_parse(p, "VISAGE_MAX_TASK_AGE_SECS", 86_400),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_task_age(&self) -> Duration {
        Duration::from_secs(self.max_task_age_secs)
    }
}
