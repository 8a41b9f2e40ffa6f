//! Job queue abstraction and its adapters.
//!
//! A [`Queue`] delivers jobs on a topic to a registered [`JobHandler`],
//! retrying failed jobs according to their attempts/backoff settings and
//! moving exhausted ones to a failed list.
//!
//! Two adapters are provided:
//!
//! - [`RedisQueue`]: reliable queue over Redis lists (RPOPLPUSH into an
//!   `active` list, delayed jobs in a sorted set)
//! - [`MemoryQueue`]: in-process queue for standalone runs and tests
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kued::queue::{job_handler, MemoryQueue, Queue};
//!
//! let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
//! queue.process("emails", 2, job_handler(|job, _ctx| async move {
//!     println!("sending {}", job.data);
//!     Ok(())
//! })).await?;
//!
//! queue.create("emails", json!({ "to": "ops" })).attempts(3).save().await?;
//! ```

pub mod job;
pub mod memory;
pub mod redis;

pub use job::{Backoff, Job, JobBuilder};
pub use memory::MemoryQueue;
pub use self::redis::{RedisQueue, RedisQueueOptions};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::metrics::{JobOutcome, MetricsCollector};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    RedisError(#[from] ::redis::RedisError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Queue has been shut down")]
    ShutDown,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Delivery details passed alongside a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub topic: String,
    /// Identifier of the consumer loop running the job.
    pub consumer: String,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
}

/// `<topic>-<i>` for the first handler on a topic, `<topic>.<n>-<i>` for
/// later ones.
pub(crate) fn consumer_name(topic: &str, registration: usize, index: usize) -> String {
    if registration == 0 {
        format!("{}-{}", topic, index)
    } else {
        format!("{}.{}-{}", topic, registration, index)
    }
}

/// Handler invoked once per delivered job. `Err` fails the job.
pub type JobHandler =
    Arc<dyn Fn(Job, JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Wrap an async closure as a [`JobHandler`].
pub fn job_handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(move |job, ctx| f(job, ctx).boxed())
}

/// A topic-based job queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Start `concurrency` consumers delivering `topic` jobs to `handler`.
    ///
    /// Calling it again for the same topic adds consumers for the new
    /// handler; every consumer of a topic competes for the same jobs.
    async fn process(
        &self,
        topic: &str,
        concurrency: usize,
        handler: JobHandler,
    ) -> Result<(), QueueError>;

    /// Store a job for delivery.
    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError>;

    /// Stop every consumer, waiting at most `timeout` for in-flight jobs.
    async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError>;
}

impl dyn Queue {
    /// Start building a job for `topic`; nothing is queued until `save()`.
    pub fn create(&self, topic: impl Into<String>, data: Value) -> JobBuilder<'_> {
        JobBuilder::new(self, Job::new(topic, data))
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What a consumer does with a job after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Completed,
    Retry(Duration),
    Failed,
}

/// Run one delivery of `job`, bounded by its ttl.
///
/// Increments the attempt counter and records the last error on the job.
pub(crate) async fn deliver(handler: &JobHandler, job: &mut Job, consumer: &str) -> Settlement {
    job.increment_attempts();

    let ctx = JobContext {
        topic: job.topic.clone(),
        consumer: consumer.to_string(),
        attempt: job.attempts,
    };

    let collector = MetricsCollector::new();
    collector.inc_jobs_in_progress();
    let start_time = Instant::now();

    let invocation = AssertUnwindSafe(handler(job.clone(), ctx)).catch_unwind();
    let result = match job.ttl() {
        Some(ttl) => match tokio::time::timeout(ttl, invocation).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(Err(JobError::Timeout(ttl))),
        },
        None => invocation.await,
    }
    .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic.as_ref()))));

    let duration = start_time.elapsed();
    collector.dec_jobs_in_progress();

    match result {
        Ok(()) => {
            collector.record_job(&job.topic, JobOutcome::Completed, duration);
            debug!(
                consumer = %consumer,
                job_id = %job.id,
                topic = %job.topic,
                duration_ms = duration.as_millis() as u64,
                "Job completed"
            );
            job.error = None;
            Settlement::Completed
        }
        Err(e) => {
            job.error = Some(e.to_string());
            if job.should_retry() {
                collector.record_job(&job.topic, JobOutcome::Retried, duration);
                warn!(
                    consumer = %consumer,
                    job_id = %job.id,
                    topic = %job.topic,
                    error = %e,
                    remaining_attempts = job.remaining_attempts(),
                    "Job failed, scheduling retry"
                );
                Settlement::Retry(job.retry_delay())
            } else {
                collector.record_job(&job.topic, JobOutcome::Failed, duration);
                error!(
                    consumer = %consumer,
                    job_id = %job.id,
                    topic = %job.topic,
                    error = %e,
                    "Job failed, moving to failed list"
                );
                Settlement::Failed
            }
        }
    }
}

/// Consumer task bookkeeping shared by the queue adapters.
pub(crate) struct Consumers {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Consumers {
    pub(crate) fn new() -> Self {
        // A single shutdown message is ever sent.
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn a consumer loop; its lifetime counts toward the active-consumer
    /// gauge.
    pub(crate) fn spawn<F>(&self, consumer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let collector = MetricsCollector::new();
            collector.consumer_started();
            consumer.await;
            collector.consumer_stopped();
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }

    /// Signal every consumer and wait for them, aborting stragglers after
    /// `timeout`.
    pub(crate) async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);

        // Consumers that already stopped have no receiver left.
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .map(|mut handles| handles.drain(..).collect())
            .unwrap_or_default();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Consumer task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("Queue consumers stopped");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                Err(QueueError::ShutdownTimeout(timeout))
            }
        }
    }
}
