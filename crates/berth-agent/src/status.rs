//! Outbound reporting of task status transitions.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use berth_core::TaskStatus;

/// Errors a status updater may report. The runner logs them and moves on.
#[derive(Debug, Error)]
pub enum StatusError {
    /// The consumer of the status stream went away.
    #[error("Status channel closed")]
    ChannelClosed,

    /// The backing store rejected the update.
    #[error("Status backend error: {0}")]
    Backend(String),
}

/// Reports task status transitions to wherever they are made durable.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn push(&self, status: TaskStatus) -> Result<(), StatusError>;
}

/// Updater that drops every status.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusUpdater;

#[async_trait]
impl StatusUpdater for NoopStatusUpdater {
    async fn push(&self, status: TaskStatus) -> Result<(), StatusError> {
        trace!(job_id = %status.job_id, state = %status.state, "Dropping status");
        Ok(())
    }
}

/// Updater that forwards every status into a channel.
///
/// # Example
///
/// ```rust,no_run
/// use berth_agent::ChannelStatusUpdater;
///
/// let (updater, mut rx) = ChannelStatusUpdater::new();
///
/// tokio::spawn(async move {
///     while let Some(status) = rx.recv().await {
///         println!("{} -> {}", status.job_id, status.state);
///     }
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ChannelStatusUpdater {
    tx: mpsc::UnboundedSender<TaskStatus>,
}

impl ChannelStatusUpdater {
    /// Create an updater and the receiver for its statuses.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusUpdater for ChannelStatusUpdater {
    async fn push(&self, status: TaskStatus) -> Result<(), StatusError> {
        self.tx.send(status).map_err(|_| StatusError::ChannelClosed)
    }
}
