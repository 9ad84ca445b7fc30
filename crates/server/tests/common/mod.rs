//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use image::{ImageFormat, Rgba, RgbaImage};

use visage_core::config::AuthConfig;
use visage_detect::{DetectError, Detector, ModelInput, RawFace};
use visage_queue::{Backoff, ConsumerOptions, MemoryQueue, QueueOptions, RetryPolicy};
use visage_ratelimit::{MemoryWindowStore, RateLimitSettings, RateLimiter, DEFAULT_MESSAGE};
use visage_server::{build_router, AppState, DetectionPipeline, TaskService, WorkerPool};
use visage_storage::ArtifactStore;
use visage_store::MemoryTaskStore;

pub const API_KEY: &str = "test-key";
pub const BOUNDARY: &str = "visage-test-boundary";

/// Detector that plays back a script; the last entry repeats.
pub struct ScriptedDetector {
    script: Mutex<Vec<Result<Vec<RawFace>, String>>>,
    pub calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Result<Vec<RawFace>, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(&self) -> Result<(), DetectError> {
        Ok(())
    }

    async fn detect(&self, _input: &ModelInput) -> Result<Vec<RawFace>, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        };
        next.map_err(DetectError::Model)
    }
}

pub fn face(age: f64, gender: &str, score: f64) -> RawFace {
    RawFace {
        age: Some(age),
        gender: Some(gender.to_string()),
        gender_score: Some(score),
    }
}

pub fn two_faces() -> Vec<RawFace> {
    vec![face(30.0, "male", 0.9), face(22.0, "female", 0.8)]
}

pub struct Harness {
    pub router: Router,
    pub service: Arc<TaskService>,
    pub tasks: Arc<MemoryTaskStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub queue: Arc<MemoryQueue>,
    pub pipeline: Arc<DetectionPipeline>,
}

pub struct HarnessOptions {
    pub api_key: Option<String>,
    pub max_requests: u32,
    pub max_attempts: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            api_key: Some(API_KEY.to_string()),
            max_requests: 100,
            max_attempts: 3,
        }
    }
}

pub fn harness(detector: Arc<dyn Detector>, options: HarnessOptions) -> Harness {
    let tasks = Arc::new(MemoryTaskStore::new());
    let artifacts = Arc::new(ArtifactStore::in_memory());
    let queue = Arc::new(MemoryQueue::new(QueueOptions {
        retry: RetryPolicy {
            max_attempts: options.max_attempts,
            backoff: Backoff::Exponential {
                delay: Duration::from_millis(10),
            },
        },
        ..QueueOptions::default()
    }));

    let service = Arc::new(TaskService::new(
        tasks.clone(),
        queue.clone(),
        artifacts.clone(),
        detector.clone(),
    ));
    let pipeline = Arc::new(DetectionPipeline::new(
        tasks.clone(),
        artifacts.clone(),
        detector,
    ));
    let limiter = RateLimiter::new(
        Arc::new(MemoryWindowStore::new()),
        RateLimitSettings {
            window: Duration::from_secs(60),
            max_requests: options.max_requests,
            message: DEFAULT_MESSAGE.to_string(),
        },
    );

    let state = Arc::new(AppState {
        service: service.clone(),
        limiter: Arc::new(limiter),
        auth: AuthConfig {
            api_key: options.api_key,
        },
        cors_origin: "*".to_string(),
        workers: None,
    });

    Harness {
        router: build_router(state),
        service,
        tasks,
        artifacts,
        queue,
        pipeline,
    }
}

impl Harness {
    /// A running worker pool over this harness's queue and pipeline.
    pub fn start_workers(&self) -> (tokio::sync::watch::Sender<bool>, tokio::task::JoinHandle<Result<(), visage_queue::QueueError>>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let pool = WorkerPool::new(
            self.queue.clone(),
            self.pipeline.clone(),
            ConsumerOptions {
                concurrency: visage_server::WORKER_CONCURRENCY,
                poll_interval: Duration::from_millis(10),
                stalled_interval: Duration::from_secs(30),
            },
        );
        (tx, pool.spawn(rx))
    }
}

pub fn png_bytes() -> Vec<u8> {
    let img = RgbaImage::from_pixel(8, 8, Rgba([120, 80, 40, 255]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn multipart_body(field: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload_request(key: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/detect/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body)).unwrap()
}

pub fn image_upload(key: Option<&str>) -> Request<Body> {
    upload_request(key, multipart_body("image", "photo.png", "image/png", &png_bytes()))
}

pub fn status_request(key: Option<&str>, task_id: &str) -> Request<Body> {
    let mut builder = Request::builder().uri(format!("/api/detect/status/{task_id}"));
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

impl Harness {
    /// True when no upload has produced a queued job.
    pub async fn nothing_queued(&self) -> bool {
        use visage_queue::WorkQueue;
        let counts = self.queue.counts().await.unwrap();
        counts.waiting + counts.delayed + counts.active == 0
    }
}
