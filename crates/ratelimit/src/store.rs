use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WindowStoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("unexpected reply: {0}")]
    Reply(String),
}

/// Result of one sliding-window step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Requests inside the window before this one.
    pub count: u32,
    /// Oldest surviving timestamp (ms), including this request when it was
    /// recorded into an empty window.
    pub oldest_ms: Option<i64>,
    /// Whether this request was recorded.
    pub recorded: bool,
}

/// Shared counting structure behind the limiter.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically drop timestamps `<= now_ms - window_ms`, count the rest
    /// and, when the count is below `limit`, record `now_ms` and push the
    /// key's expiry out to `window_ms`.
    async fn hit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<WindowOutcome, WindowStoreError>;

    /// Round-trip to the backing service. In-process stores are always up.
    async fn ping(&self) -> Result<(), WindowStoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}
