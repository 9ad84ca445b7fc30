//! Worker pool: a queue consumer bound to the detection pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

use visage_core::Config;
use visage_queue::{Consumer, ConsumerMetrics, ConsumerOptions, JobHandler, QueueError, WorkQueue};

/// Concurrent model invocations per process.
pub const WORKER_CONCURRENCY: usize = 5;

pub fn consumer_options(config: &Config) -> ConsumerOptions {
    ConsumerOptions {
        concurrency: config.worker.concurrency.max(1),
        poll_interval: Duration::from_millis(config.queue.poll_ms),
        stalled_interval: Duration::from_millis(config.queue.stalled_interval_ms),
    }
}

pub struct WorkerPool {
    consumer: Consumer,
    handler: Arc<dyn JobHandler>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        handler: Arc<dyn JobHandler>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            consumer: Consumer::new(queue, options),
            handler,
        }
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.consumer.metrics()
    }

    /// Run until `shutdown` flips; the handle resolves once in-flight jobs
    /// have drained.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), QueueError>> {
        tokio::spawn(async move {
            let outcome = self.consumer.run(self.handler.clone(), shutdown).await;
            if let Err(e) = &outcome {
                error!(error = %e, "worker pool exited with error");
            }
            outcome
        })
    }
}
