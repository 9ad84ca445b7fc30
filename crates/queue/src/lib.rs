//! At-least-once work queue with retry, backoff and stall recovery.
//!
//! Backends implement [`WorkQueue`]; [`Consumer`] drives any backend with a
//! bounded number of concurrent [`JobHandler`] invocations.

pub mod consumer;
pub mod error;
pub mod job;
pub mod memory;
pub mod retry;
pub mod runner;
pub mod sqlite;

pub use consumer::{JobHandler, WorkQueue};
pub use error::QueueError;
pub use job::{FailOutcome, Job, JobState, Lease, QueueCounts, QueueOptions, StallReport};
pub use memory::MemoryQueue;
pub use retry::{Backoff, RetryPolicy};
pub use runner::{Consumer, ConsumerMetrics, ConsumerOptions, ConsumerSnapshot};
pub use sqlite::SqliteQueue;
