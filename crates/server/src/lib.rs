//! Detection service: task service, worker pool, pipeline and HTTP surface.

pub mod api;
pub mod cli;
pub mod middleware;
pub mod pipeline;
pub mod router;
pub mod service;
pub mod startup;
pub mod state;
pub mod worker;

pub use pipeline::{CleanupOutcome, DetectionPipeline, PipelineError};
pub use router::build_router;
pub use service::{ServiceError, SweepHandle, SweepReport, TaskService};
pub use state::AppState;
pub use worker::{WorkerPool, WORKER_CONCURRENCY};
