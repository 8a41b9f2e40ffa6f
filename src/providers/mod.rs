//! Built-in provider modules, registered under `kued/providers/`.
//!
//! | Path | Provides | Instance |
//! |------|----------|----------|
//! | `tracing-logger` | `logger` | `Arc<dyn Logger>` |
//! | `redis-queue` | `kue` | `Arc<dyn Queue>` |
//! | `memory-queue` | `kue` | `Arc<dyn Queue>` |
//! | `redis-checkpointer` | `checkpointer` | `Arc<dyn CheckpointStore>` |
//! | `memory-checkpointer` | `checkpointer` | `Arc<dyn CheckpointStore>` |
//! | `imq` | `imq` | `Arc<dyn MessageQueue>` |
//! | `task-manager` | `tasks` | `Arc<TaskManager>` |

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::checkpoint::{
    CheckpointStore, MemoryCheckpointStore, RedisCheckpointOptions, RedisCheckpointStore,
    DEFAULT_CHECKPOINT_PREFIX,
};
use crate::config::DependencyRequest;
use crate::dependency::{into_instance, FactoryContext, Instance, ProviderModule, ProviderOptions};
use crate::error::DependencyError;
use crate::logger::{Logger, TracingLogger};
use crate::mq::{IronMqClient, IronMqOptions, MessageQueue};
use crate::queue::{MemoryQueue, Queue, RedisQueue, RedisQueueOptions};
use crate::task_manager::TaskManager;
use crate::worker::QUEUE_PROVIDER;

fn construction_error(ctx: &FactoryContext<'_>, err: impl std::fmt::Display) -> DependencyError {
    DependencyError::Construction {
        id: ctx.config.instance_id(),
        reason: err.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggerOptions {
    component: String,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            component: "kued".to_string(),
        }
    }
}

/// Logger forwarding to `tracing`; the fallback `logger:default`.
pub struct TracingLoggerProvider;

impl ProviderModule for TracingLoggerProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn create(&self, ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        let options: LoggerOptions = ctx.options()?;
        let logger: Arc<dyn Logger> = Arc::new(TracingLogger::new(options.component));
        Ok(Some(into_instance(logger)))
    }
}

/// Redis-backed job queue.
pub struct RedisQueueProvider;

impl ProviderModule for RedisQueueProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn create(&self, ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        let options: RedisQueueOptions = ctx.options()?;
        let queue = RedisQueue::new(options).map_err(|e| construction_error(ctx, e))?;
        let queue: Arc<dyn Queue> = Arc::new(queue);
        Ok(Some(into_instance(queue)))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MemoryQueueOptions {
    poll_interval_ms: Option<u64>,
}

/// In-process job queue.
pub struct MemoryQueueProvider;

impl ProviderModule for MemoryQueueProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn create(&self, ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        let options: MemoryQueueOptions = ctx.options()?;
        let mut queue = MemoryQueue::new();
        if let Some(ms) = options.poll_interval_ms {
            queue = queue.with_poll_interval(Duration::from_millis(ms));
        }
        let queue: Arc<dyn Queue> = Arc::new(queue);
        Ok(Some(into_instance(queue)))
    }
}

/// Redis-backed checkpoint store.
pub struct RedisCheckpointerProvider;

impl ProviderModule for RedisCheckpointerProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn create(&self, ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        let options: RedisCheckpointOptions = ctx.options()?;
        let store = RedisCheckpointStore::new(options).map_err(|e| construction_error(ctx, e))?;
        let store: Arc<dyn CheckpointStore> = Arc::new(store);
        Ok(Some(into_instance(store)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MemoryCheckpointOptions {
    prefix: String,
}

impl Default for MemoryCheckpointOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CHECKPOINT_PREFIX.to_string(),
        }
    }
}

/// In-process checkpoint store.
pub struct MemoryCheckpointerProvider;

impl ProviderModule for MemoryCheckpointerProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn create(&self, ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        let options: MemoryCheckpointOptions = ctx.options()?;
        let store: Arc<dyn CheckpointStore> =
            Arc::new(MemoryCheckpointStore::with_prefix(options.prefix));
        Ok(Some(into_instance(store)))
    }
}

/// IronMQ client.
pub struct ImqProvider;

impl ProviderModule for ImqProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn create(&self, ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        let options: IronMqOptions = ctx.options()?;
        let client = IronMqClient::new(options).map_err(|e| construction_error(ctx, e))?;
        let client: Arc<dyn MessageQueue> = Arc::new(client);
        Ok(Some(into_instance(client)))
    }
}

/// Task manager over the `kue` provider, pulled through the dependency
/// manager at construction.
pub struct TaskManagerProvider;

impl ProviderModule for TaskManagerProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn uses_dependency_manager(&self) -> bool {
        true
    }

    fn create(&self, ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        let queue: Arc<dyn Queue> = ctx
            .manager()?
            .require(&DependencyRequest::new(QUEUE_PROVIDER))?;
        let tasks = Arc::new(TaskManager::new(Arc::clone(&ctx.logger), queue));
        Ok(Some(into_instance(tasks)))
    }
}
