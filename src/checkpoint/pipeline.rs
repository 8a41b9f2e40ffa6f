//! Checkpoint-gated job processing.
//!
//! A [`CheckpointBuilder`] collects the configuration of a gated topic and
//! produces an immutable [`CheckpointPipeline`]. Each job then runs through:
//!
//! 1. `key = key_factory(job.data)`
//! 2. read the checkpoint stored under `key`
//! 3. `iff(job.data, checkpoint)` decides whether to proceed
//! 4. the handler runs, receiving any extra data from the predicate
//! 5. a value returned by the handler is written back under `key`
//!
//! Steps run strictly in order; a failure at any step fails the job.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::store::CheckpointStore;
use crate::error::JobError;
use crate::logger::Logger;
use crate::metrics::MetricsCollector;
use crate::queue::{Job, JobContext, JobHandler};
use crate::worker::{HandlerRef, Worker, WorkerError};

/// Maps job data to the checkpoint key it is gated on.
pub type KeyFactory = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Decides, from job data and the current checkpoint, whether to run the
/// handler.
pub type Predicate = Arc<
    dyn Fn(Value, Option<Value>) -> BoxFuture<'static, Result<Decision, JobError>> + Send + Sync,
>;

/// Handler of a gated job. Returning `Some(value)` writes a new checkpoint.
pub type CheckpointHandler = Arc<
    dyn Fn(Job, JobContext, Option<Value>) -> BoxFuture<'static, Result<Option<Value>, JobError>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`CheckpointHandler`].
pub fn checkpoint_handler<F, Fut>(f: F) -> CheckpointHandler
where
    F: Fn(Job, JobContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, JobError>> + Send + 'static,
{
    Arc::new(move |job, ctx, extra| f(job, ctx, extra).boxed())
}

/// Predicate verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub proceed: bool,
    /// Passed to the handler as its third argument.
    pub extra: Option<Value>,
}

impl Decision {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            extra: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            proceed: false,
            extra: None,
        }
    }

    pub fn from_bool(proceed: bool) -> Self {
        Self {
            proceed,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// What happened to a job that went through the pipeline successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Predicate declined; handler not invoked.
    Skipped,
    /// Handler ran and returned no new checkpoint.
    Processed,
    /// Handler ran and its checkpoint was written.
    Checkpointed,
}

impl CheckpointOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Processed => "processed",
            Self::Checkpointed => "checkpointed",
        }
    }
}

/// Settled configuration of a gated topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub topic: String,
    pub concurrency: usize,
    pub ignore_checkpoint_failure: bool,
    pub fail_if_checkpoint_absent: bool,
}

/// Fluent configuration of a gated topic.
pub struct CheckpointBuilder<'a> {
    worker: Option<&'a Worker>,
    store: Arc<dyn CheckpointStore>,
    logger: Arc<dyn Logger>,
    topic: Option<String>,
    concurrency: usize,
    key_factory: Option<KeyFactory>,
    predicate: Option<Predicate>,
    ignore_checkpoint_failure: bool,
    fail_if_checkpoint_absent: bool,
}

impl CheckpointBuilder<'static> {
    /// A builder not bound to a worker; finish it with [`build`](Self::build).
    pub fn new(store: Arc<dyn CheckpointStore>, logger: Arc<dyn Logger>) -> Self {
        Self::with_worker(None, store, logger)
    }
}

impl<'a> CheckpointBuilder<'a> {
    pub(crate) fn with_worker(
        worker: Option<&'a Worker>,
        store: Arc<dyn CheckpointStore>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            worker,
            store,
            logger,
            topic: None,
            concurrency: 1,
            key_factory: None,
            predicate: None,
            ignore_checkpoint_failure: false,
            fail_if_checkpoint_absent: false,
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn key_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.key_factory = Some(Arc::new(factory));
        self
    }

    pub fn iff<F, Fut>(mut self, predicate: F) -> Self
    where
        F: Fn(Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Decision, JobError>> + Send + 'static,
    {
        self.predicate = Some(Arc::new(move |data, checkpoint| {
            predicate(data, checkpoint).boxed()
        }));
        self
    }

    /// Continue past checkpoint store read errors instead of failing the job.
    pub fn ignore_checkpoint_failure(mut self) -> Self {
        self.ignore_checkpoint_failure = true;
        self
    }

    /// Fail jobs whose checkpoint has never been written.
    pub fn fail_if_checkpoint_absent(mut self) -> Self {
        self.fail_if_checkpoint_absent = true;
        self
    }

    /// Validate the configuration and freeze it into a pipeline.
    ///
    /// # Errors
    ///
    /// `MissingTopic`, `MissingPredicate` or `MissingKeyFactory` when the
    /// corresponding setter was never called.
    pub fn build(self, handler: CheckpointHandler) -> Result<CheckpointPipeline, WorkerError> {
        let topic = self
            .topic
            .filter(|t| !t.trim().is_empty())
            .ok_or(WorkerError::MissingTopic)?;
        let predicate = self.predicate.ok_or(WorkerError::MissingPredicate)?;
        let key_factory = self.key_factory.ok_or(WorkerError::MissingKeyFactory)?;

        Ok(CheckpointPipeline {
            config: CheckpointConfig {
                topic,
                concurrency: self.concurrency,
                ignore_checkpoint_failure: self.ignore_checkpoint_failure,
                fail_if_checkpoint_absent: self.fail_if_checkpoint_absent,
            },
            key_factory,
            predicate,
            handler,
            store: self.store,
            logger: self.logger,
        })
    }

    /// Build the pipeline and register it on the owning worker's topic.
    ///
    /// `handler` may name a checkpoint handler registered on the worker.
    pub async fn process(
        self,
        handler: impl Into<HandlerRef<CheckpointHandler>>,
    ) -> Result<Arc<CheckpointPipeline>, WorkerError> {
        let worker = self.worker.ok_or(WorkerError::Unbound)?;
        let handler = worker.handlers().checkpoint(handler.into())?;
        let pipeline = Arc::new(self.build(handler)?);

        worker
            .process(
                &pipeline.config.topic,
                pipeline.config.concurrency,
                Arc::clone(&pipeline).job_handler(),
            )
            .await?;

        Ok(pipeline)
    }
}

/// Immutable, executable checkpoint pipeline.
pub struct CheckpointPipeline {
    config: CheckpointConfig,
    key_factory: KeyFactory,
    predicate: Predicate,
    handler: CheckpointHandler,
    store: Arc<dyn CheckpointStore>,
    logger: Arc<dyn Logger>,
}

impl CheckpointPipeline {
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Run one job through the pipeline.
    pub async fn run(&self, job: Job, ctx: JobContext) -> Result<CheckpointOutcome, JobError> {
        let collector = MetricsCollector::new();
        let result = self.execute(job, ctx).await;

        match &result {
            Ok(outcome) => collector.record_checkpoint(&self.config.topic, outcome.as_str()),
            Err(_) => collector.record_checkpoint(&self.config.topic, "failed"),
        }

        result
    }

    async fn execute(&self, job: Job, ctx: JobContext) -> Result<CheckpointOutcome, JobError> {
        let key = (self.key_factory)(&job.data);

        let checkpoint = match self.store.get_checkpoint(&key).await {
            Ok(value) => value.filter(|v| !v.is_null()),
            Err(e) => {
                self.logger.error(&format!("Could not get checkpoint [{}] value: {}", key, e));
                if !self.config.ignore_checkpoint_failure {
                    return Err(e.into());
                }
                None
            }
        };

        if checkpoint.is_none() {
            self.logger.warn(&format!("No checkpoint value for {}.", key));
            if self.config.fail_if_checkpoint_absent {
                return Err(JobError::CheckpointAbsent(key));
            }
        }

        let decision = (self.predicate)(job.data.clone(), checkpoint).await?;

        if !decision.proceed {
            self.logger.info(&format!(
                "Nothing to do; [{}] does not need to be updated.",
                key
            ));
            return Ok(CheckpointOutcome::Skipped);
        }

        match (self.handler)(job, ctx, decision.extra).await? {
            Some(value) => {
                if let Err(e) = self.store.update_checkpoint(&key, &value).await {
                    self.logger.error(&format!("Failed to update checkpoint [{}]: {}.", key, e));
                    return Err(e.into());
                }
                self.logger.info(&format!("Checkpoint [{}] updated.", key));
                Ok(CheckpointOutcome::Checkpointed)
            }
            None => Ok(CheckpointOutcome::Processed),
        }
    }

    /// Adapt the pipeline into a queue job handler.
    pub fn job_handler(self: Arc<Self>) -> JobHandler {
        Arc::new(move |job, ctx| {
            let pipeline = Arc::clone(&self);
            async move { pipeline.run(job, ctx).await.map(|_| ()) }.boxed()
        })
    }
}
