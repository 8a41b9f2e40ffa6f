//! In-process job queue.
//!
//! Jobs live in per-topic deques inside the current process; nothing
//! survives a restart. Delivery, retry and failed-list semantics match the
//! Redis adapter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    consumer_name, deliver, Consumers, Job, JobHandler, Queue, QueueError, Settlement,
};

/// Fallback wake-up for idle consumers.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct TopicState {
    pending: Mutex<VecDeque<Job>>,
    failed: Mutex<Vec<Job>>,
    notify: Notify,
    /// Handlers registered so far; each one gets its own consumers.
    registrations: AtomicUsize,
}

impl TopicState {
    fn push(&self, job: Job) {
        if let Ok(mut pending) = self.pending.lock() {
            if job.priority > 0 {
                pending.push_front(job);
            } else {
                pending.push_back(job);
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        self.pending.lock().ok().and_then(|mut pending| pending.pop_front())
    }

    fn schedule(self: &Arc<Self>, job: Job, delay: Duration) {
        if delay.is_zero() {
            self.push(job);
            return;
        }
        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.push(job);
        });
    }
}

/// Job queue held entirely in memory.
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    consumers: Consumers,
    poll_interval: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            consumers: Consumers::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        match self.topics.lock() {
            Ok(mut topics) => Arc::clone(topics.entry(name.to_string()).or_default()),
            Err(_) => Arc::new(TopicState::default()),
        }
    }

    /// Number of jobs waiting for a consumer.
    pub fn pending_len(&self, topic: &str) -> usize {
        self.topic(topic)
            .pending
            .lock()
            .map(|pending| pending.len())
            .unwrap_or_default()
    }

    /// Jobs that exhausted their attempts.
    pub fn failed(&self, topic: &str) -> Vec<Job> {
        self.topic(topic)
            .failed
            .lock()
            .map(|failed| failed.clone())
            .unwrap_or_default()
    }
}

async fn consume(
    consumer: String,
    state: Arc<TopicState>,
    handler: JobHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
) {
    debug!(consumer = %consumer, "Consumer started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(broadcast::error::TryRecvError::Empty) => {}
        }

        let Some(mut job) = state.pop() else {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = state.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        match deliver(&handler, &mut job, &consumer).await {
            Settlement::Completed => {}
            Settlement::Retry(delay) => state.schedule(job, delay),
            Settlement::Failed => {
                if let Ok(mut failed) = state.failed.lock() {
                    failed.push(job);
                }
            }
        }
    }

    debug!(consumer = %consumer, "Consumer stopped");
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn process(
        &self,
        topic: &str,
        concurrency: usize,
        handler: JobHandler,
    ) -> Result<(), QueueError> {
        if self.consumers.is_closed() {
            return Err(QueueError::ShutDown);
        }

        let state = self.topic(topic);
        let registration = state.registrations.fetch_add(1, Ordering::SeqCst);

        let concurrency = concurrency.max(1);
        for i in 0..concurrency {
            self.consumers.spawn(consume(
                consumer_name(topic, registration, i),
                Arc::clone(&state),
                Arc::clone(&handler),
                self.consumers.subscribe(),
                self.poll_interval,
            ));
        }

        info!(topic = %topic, concurrency, registration, "Processing topic in memory");
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        if self.consumers.is_closed() {
            return Err(QueueError::ShutDown);
        }

        let id = job.id;
        let state = self.topic(&job.topic);
        match job.delay() {
            Some(delay) => state.schedule(job, delay),
            None => state.push(job),
        }
        Ok(id)
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        self.consumers.shutdown(timeout).await
    }
}
