use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::{FlowError, Result},
    models::WorkItem,
};

/// Publishing side of the task queue
///
/// Delivery is at-least-once with no ordering guarantee; consumers must
/// tolerate duplicates.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> Result<()>;
}

/// In-process queue backed by an unbounded tokio channel
#[derive(Clone)]
pub struct ChannelTaskQueue {
    sender: mpsc::UnboundedSender<WorkItem>,
}

impl ChannelTaskQueue {
    /// Create a queue and the receiver a worker pool consumes from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.sender
            .send(item)
            .map_err(|_| FlowError::Queue("task queue is closed".to_string()))
    }
}
