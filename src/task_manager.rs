//! Hands work to background workers through the job queue.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::config::DependencyRequest;
use crate::dependency::LOGGER_PROVIDER;
use crate::logger::Logger;
use crate::queue::{JobBuilder, Queue, QueueError};
use crate::worker::QUEUE_PROVIDER;

/// Bound on waiting for in-flight jobs when closing.
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Enqueues tasks for workers elsewhere on the network.
pub struct TaskManager {
    logger: Arc<dyn Logger>,
    queue: Arc<dyn Queue>,
}

impl TaskManager {
    pub fn new(logger: Arc<dyn Logger>, queue: Arc<dyn Queue>) -> Self {
        Self { logger, queue }
    }

    pub fn dependencies() -> Vec<DependencyRequest> {
        vec![
            DependencyRequest::new(LOGGER_PROVIDER),
            DependencyRequest::new(QUEUE_PROVIDER),
        ]
    }

    /// Start a task for `topic`; the caller must `save()` it.
    pub fn enqueue(&self, topic: &str, payload: Value) -> JobBuilder<'_> {
        self.queue.create(topic, payload)
    }

    /// Enqueue a task with default options.
    pub async fn enqueue_and_save(&self, topic: &str, payload: Value) -> Result<Uuid, QueueError> {
        self.enqueue(topic, payload).save().await
    }

    /// Shut the queue down, waiting at most [`CLOSE_TIMEOUT`].
    pub async fn close(&self) -> Result<(), QueueError> {
        self.queue.shutdown(CLOSE_TIMEOUT).await.map_err(|e| {
            self.logger.error(&format!("Error closing the connection: {}.", e));
            e
        })
    }
}
