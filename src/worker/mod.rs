//! Job-queue workers.
//!
//! A [`Worker`] binds a queue, a logger and an optional checkpoint store.
//! Handlers are registered inline or by name: named handlers live in a
//! [`HandlerTable`] filled when the worker is constructed, so a name that
//! was never registered fails registration instead of failing at delivery.
//!
//! Every handler the worker hands to its queue runs inside a panic boundary;
//! a panicking handler fails its job instead of taking the process down.

pub mod builtin;
pub mod cron;

pub use builtin::{DumperWorkerFactory, HelloWorkerFactory};
pub use cron::{tick_handler, CronOptions, CronTimer, CronWorker, TickHandler};

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::checkpoint::{CheckpointBuilder, CheckpointHandler, CheckpointStore};
use crate::component::ResolvedDependencies;
use crate::config::DependencyRequest;
use crate::error::{ComponentError, JobError};
use crate::logger::Logger;
use crate::queue::{panic_message, Job, JobHandler, Queue, QueueError};

/// Provider kind of the job queue.
pub const QUEUE_PROVIDER: &str = "kue";

/// Provider kind of the checkpoint store.
pub const CHECKPOINTER_PROVIDER: &str = "checkpointer";

/// Errors raised while registering worker handlers.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No handler named '{0}' is registered on the worker")]
    HandlerNotFound(String),

    #[error("Topic must be supplied to the checkpoint")]
    MissingTopic,

    #[error("Predicate must be supplied to the checkpoint")]
    MissingPredicate,

    #[error("Key factory must be supplied to the checkpoint")]
    MissingKeyFactory,

    #[error(
        "Ensure a valid checkpointer has been registered with the worker before using the checkpoint facility"
    )]
    NoCheckpointer,

    #[error("Checkpoint is not bound to a worker")]
    Unbound,

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A handler given directly or by the name it was registered under.
pub enum HandlerRef<H> {
    Named(String),
    Inline(H),
}

impl<H> From<&str> for HandlerRef<H> {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl<H> From<String> for HandlerRef<H> {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<JobHandler> for HandlerRef<JobHandler> {
    fn from(handler: JobHandler) -> Self {
        Self::Inline(handler)
    }
}

impl From<CheckpointHandler> for HandlerRef<CheckpointHandler> {
    fn from(handler: CheckpointHandler) -> Self {
        Self::Inline(handler)
    }
}

impl From<TickHandler> for HandlerRef<TickHandler> {
    fn from(handler: TickHandler) -> Self {
        Self::Inline(handler)
    }
}

impl<H> fmt::Debug for HandlerRef<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

/// Named handlers of a worker.
#[derive(Clone, Default)]
pub struct HandlerTable {
    jobs: HashMap<String, JobHandler>,
    checkpoints: HashMap<String, CheckpointHandler>,
    ticks: HashMap<String, TickHandler>,
}

fn lookup<H: Clone>(table: &HashMap<String, H>, handler: HandlerRef<H>) -> Result<H, WorkerError> {
    match handler {
        HandlerRef::Inline(handler) => Ok(handler),
        HandlerRef::Named(name) => table
            .get(&name)
            .cloned()
            .ok_or(WorkerError::HandlerNotFound(name)),
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, name: impl Into<String>, handler: JobHandler) -> Self {
        self.jobs.insert(name.into(), handler);
        self
    }

    pub fn with_checkpoint(mut self, name: impl Into<String>, handler: CheckpointHandler) -> Self {
        self.checkpoints.insert(name.into(), handler);
        self
    }

    pub fn with_tick(mut self, name: impl Into<String>, handler: TickHandler) -> Self {
        self.ticks.insert(name.into(), handler);
        self
    }

    pub fn job(&self, handler: HandlerRef<JobHandler>) -> Result<JobHandler, WorkerError> {
        lookup(&self.jobs, handler)
    }

    pub fn checkpoint(
        &self,
        handler: HandlerRef<CheckpointHandler>,
    ) -> Result<CheckpointHandler, WorkerError> {
        lookup(&self.checkpoints, handler)
    }

    pub fn tick(&self, handler: HandlerRef<TickHandler>) -> Result<TickHandler, WorkerError> {
        lookup(&self.ticks, handler)
    }
}

/// Job-queue consumer bound to its dependencies.
pub struct Worker {
    name: String,
    options: Value,
    logger: Arc<dyn Logger>,
    queue: Arc<dyn Queue>,
    checkpointer: Option<Arc<dyn CheckpointStore>>,
    handlers: HandlerTable,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        options: Value,
        logger: Arc<dyn Logger>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            logger,
            queue,
            checkpointer: None,
            handlers: HandlerTable::new(),
        }
    }

    /// Dependencies every worker asks for: the logger, the job queue and,
    /// optionally, a checkpoint store.
    pub fn dependencies() -> Vec<DependencyRequest> {
        vec![
            DependencyRequest::new(crate::dependency::LOGGER_PROVIDER),
            DependencyRequest::new(QUEUE_PROVIDER),
            DependencyRequest::new(CHECKPOINTER_PROVIDER).optional(),
        ]
    }

    /// Build a worker from dependencies resolved for [`Worker::dependencies`].
    pub fn from_dependencies(
        name: &str,
        options: &Value,
        deps: &ResolvedDependencies,
    ) -> Result<Self, ComponentError> {
        let worker = Self::new(name, options.clone(), deps.logger(), deps.require(QUEUE_PROVIDER)?);
        Ok(match deps.optional::<Arc<dyn CheckpointStore>>(CHECKPOINTER_PROVIDER)? {
            Some(store) => worker.with_checkpointer(store),
            None => worker,
        })
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn CheckpointStore>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Value {
        &self.options
    }

    /// Deserialize the worker's options; a missing block parses as `{}`.
    pub fn parse_options<T: DeserializeOwned>(&self) -> Result<T, ComponentError> {
        let options = if self.options.is_null() {
            Value::Object(Default::default())
        } else {
            self.options.clone()
        };
        serde_json::from_value(options).map_err(|e| ComponentError::InvalidOptions {
            component: self.name.clone(),
            reason: e.to_string(),
        })
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.checkpointer.as_ref()
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Register a handler for `topic` on the worker's queue.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` if a named handler is not in the handler table, or
    /// the queue's error if registration fails.
    pub async fn process(
        &self,
        topic: &str,
        concurrency: usize,
        handler: impl Into<HandlerRef<JobHandler>>,
    ) -> Result<(), WorkerError> {
        let handler = self.handlers.job(handler.into())?;
        let guarded = guard_handler(handler, Arc::clone(&self.logger));

        self.queue
            .process(topic, concurrency.max(1), guarded)
            .await?;
        Ok(())
    }

    /// Start configuring a checkpoint-gated topic on this worker.
    pub fn checkpoint(&self) -> Result<CheckpointBuilder<'_>, WorkerError> {
        let store = self.checkpointer.clone().ok_or(WorkerError::NoCheckpointer)?;
        Ok(CheckpointBuilder::with_worker(
            Some(self),
            store,
            Arc::clone(&self.logger),
        ))
    }

    /// Log an error against a job.
    pub fn report_error(&self, job: &Job, message: &str, err: &dyn fmt::Display) {
        self.logger.error(&format!(
            "Error: {} (job {} on {}): {}",
            message, job.id, job.topic, err
        ));
    }
}

/// Wrap a handler so that panics fail the job instead of the process.
fn guard_handler(handler: JobHandler, logger: Arc<dyn Logger>) -> JobHandler {
    Arc::new(move |job, ctx| {
        let handler = Arc::clone(&handler);
        let logger = Arc::clone(&logger);
        async move {
            match AssertUnwindSafe(async move { handler(job, ctx).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    logger.error(&format!(
                        "Job failed to complete due to unhandled panic: {}.",
                        message
                    ));
                    Err(JobError::Panicked(message))
                }
            }
        }
        .boxed()
    })
}


#[cfg(test)]
mod tests {
    use super::testing::CapturingQueue;
    use super::*;
    use crate::checkpoint::{checkpoint_handler, Decision, MemoryCheckpointStore};
    use crate::logger::testing::RecordingLogger;
    use crate::queue::{job_handler, JobContext};
    use serde_json::json;
    use std::sync::Mutex;
    use tracing::Level;

    fn ctx(topic: &str) -> JobContext {
        JobContext {
            topic: topic.to_string(),
            consumer: format!("{}-0", topic),
            attempt: 1,
        }
    }

    fn worker_with(queue: Arc<CapturingQueue>, handlers: HandlerTable) -> Worker {
        Worker::new(
            "TestWorker",
            json!({}),
            Arc::new(RecordingLogger::default()),
            queue,
        )
        .with_handlers(handlers)
    }

    #[tokio::test]
    async fn test_process_registers_inline_handler() {
        let queue = Arc::new(CapturingQueue::default());
        let worker = worker_with(queue.clone(), HandlerTable::new());

        worker
            .process("test-topic", 42, job_handler(|_job, _ctx| async { Ok(()) }))
            .await
            .expect("registered");

        assert_eq!(queue.concurrency("test-topic"), Some(42));
    }

    #[tokio::test]
    async fn test_process_resolves_named_handler() {
        let queue = Arc::new(CapturingQueue::default());
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);

        let worker = worker_with(
            queue.clone(),
            HandlerTable::new().with_job(
                "handler",
                job_handler(move |job, _ctx| {
                    let sink = Arc::clone(&sink);
                    async move {
                        *sink.lock().expect("lock") = Some(job.data);
                        Ok(())
                    }
                }),
            ),
        );

        worker
            .process("test-topic", 10, "handler")
            .await
            .expect("registered");

        let handler = queue.handler("test-topic").expect("captured");
        handler(Job::new("test-topic", json!({ "foo": "bar" })), ctx("test-topic"))
            .await
            .expect("handled");

        assert_eq!(*received.lock().expect("lock"), Some(json!({ "foo": "bar" })));
    }

    #[tokio::test]
    async fn test_unknown_named_handler_is_rejected() {
        let queue = Arc::new(CapturingQueue::default());
        let worker = worker_with(queue.clone(), HandlerTable::new());

        let err = worker
            .process("test-topic", 1, "notfound")
            .await
            .expect_err("unknown handler");

        assert!(matches!(err, WorkerError::HandlerNotFound(name) if name == "notfound"));
        assert!(queue.handler("test-topic").is_none());
    }

    #[tokio::test]
    async fn test_zero_concurrency_defaults_to_one() {
        let queue = Arc::new(CapturingQueue::default());
        let worker = worker_with(queue.clone(), HandlerTable::new());

        worker
            .process("test-topic", 0, job_handler(|_job, _ctx| async { Ok(()) }))
            .await
            .expect("registered");

        assert_eq!(queue.concurrency("test-topic"), Some(1));
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_the_job() {
        let queue = Arc::new(CapturingQueue::default());
        let logger = Arc::new(RecordingLogger::default());
        let worker = Worker::new("TestWorker", json!({}), logger.clone(), queue.clone());

        worker
            .process(
                "test-topic",
                1,
                job_handler(|_job, _ctx| async { panic!("Oops!") }),
            )
            .await
            .expect("registered");

        let handler = queue.handler("test-topic").expect("captured");
        let err = handler(Job::new("test-topic", json!({})), ctx("test-topic"))
            .await
            .expect_err("panic becomes a job failure");

        assert!(matches!(err, JobError::Panicked(ref m) if m == "Oops!"));
        assert!(logger.contains(Level::ERROR, "unhandled panic"));
    }

    #[test]
    fn test_checkpoint_requires_store() {
        let worker = worker_with(Arc::new(CapturingQueue::default()), HandlerTable::new());
        assert!(matches!(
            worker.checkpoint().err(),
            Some(WorkerError::NoCheckpointer)
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_process_uses_named_handler() {
        let queue = Arc::new(CapturingQueue::default());
        let worker = worker_with(
            queue.clone(),
            HandlerTable::new().with_checkpoint(
                "handler",
                checkpoint_handler(|_job, _ctx, _extra| async { Ok(Some(json!(1))) }),
            ),
        )
        .with_checkpointer(Arc::new(MemoryCheckpointStore::new()));

        let pipeline = worker
            .checkpoint()
            .expect("store present")
            .topic("foo")
            .key_factory(|_| "foo".to_string())
            .iff(|_, _| async { Ok(Decision::proceed()) })
            .process("handler")
            .await
            .expect("registered");

        assert_eq!(pipeline.config().topic, "foo");
        assert_eq!(queue.concurrency("foo"), Some(1));

        let err = worker
            .checkpoint()
            .expect("store present")
            .topic("bar")
            .key_factory(|_| "bar".to_string())
            .iff(|_, _| async { Ok(Decision::proceed()) })
            .process("missing")
            .await
            .err();
        assert!(matches!(err, Some(WorkerError::HandlerNotFound(_))));
    }

    #[test]
    fn test_dependencies() {
        let deps = Worker::dependencies();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[1].provider, "kue");
        assert!(deps[2].optional);
    }
}
