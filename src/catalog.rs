//! Registry of the modules a configuration can name.
//!
//! Configurations refer to implementations by string (`require` of a
//! provider or worker, the scheme of a bridge endpoint). The catalog is the
//! single place those strings are turned into code. Framework modules live
//! under the `kued/` namespace; applications register their own alongside.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bridge::{
    Direction, EndpointFactory, ImqInputFactory, ImqOutputFactory, QueueInputFactory,
    QueueOutputFactory,
};
use crate::component::ComponentFactory;
use crate::dependency::ProviderModule;
use crate::providers::{
    ImqProvider, MemoryCheckpointerProvider, MemoryQueueProvider, RedisCheckpointerProvider,
    RedisQueueProvider, TaskManagerProvider, TracingLoggerProvider,
};
use crate::worker::{DumperWorkerFactory, HelloWorkerFactory};

/// Lookup tables from module references to implementations.
#[derive(Default)]
pub struct ModuleCatalog {
    providers: HashMap<String, Arc<dyn ProviderModule>>,
    components: HashMap<String, Arc<dyn ComponentFactory>>,
    inputs: HashMap<String, Arc<dyn EndpointFactory>>,
    outputs: HashMap<String, Arc<dyn EndpointFactory>>,
}

impl ModuleCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog holding every framework module.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_provider("kued/providers/tracing-logger", TracingLoggerProvider)
            .with_provider("kued/providers/redis-queue", RedisQueueProvider)
            .with_provider("kued/providers/memory-queue", MemoryQueueProvider)
            .with_provider("kued/providers/redis-checkpointer", RedisCheckpointerProvider)
            .with_provider("kued/providers/memory-checkpointer", MemoryCheckpointerProvider)
            .with_provider("kued/providers/imq", ImqProvider)
            .with_provider("kued/providers/task-manager", TaskManagerProvider)
            .with_component("kued/workers/dumper", DumperWorkerFactory)
            .with_component("kued/workers/hello", HelloWorkerFactory)
            .with_endpoint(Direction::Input, "kue", QueueInputFactory)
            .with_endpoint(Direction::Output, "kue", QueueOutputFactory)
            .with_endpoint(Direction::Input, "imq", ImqInputFactory)
            .with_endpoint(Direction::Output, "imq", ImqOutputFactory)
    }

    pub fn with_provider(
        mut self,
        path: impl Into<String>,
        module: impl ProviderModule + 'static,
    ) -> Self {
        self.register_provider(path, Arc::new(module));
        self
    }

    pub fn with_component(
        mut self,
        path: impl Into<String>,
        factory: impl ComponentFactory + 'static,
    ) -> Self {
        self.register_component(path, Arc::new(factory));
        self
    }

    pub fn with_endpoint(
        mut self,
        direction: Direction,
        scheme: impl Into<String>,
        factory: impl EndpointFactory + 'static,
    ) -> Self {
        self.register_endpoint(direction, scheme, Arc::new(factory));
        self
    }

    pub fn register_provider(&mut self, path: impl Into<String>, module: Arc<dyn ProviderModule>) {
        self.providers.insert(path.into(), module);
    }

    pub fn register_component(
        &mut self,
        path: impl Into<String>,
        factory: Arc<dyn ComponentFactory>,
    ) {
        self.components.insert(path.into(), factory);
    }

    pub fn register_endpoint(
        &mut self,
        direction: Direction,
        scheme: impl Into<String>,
        factory: Arc<dyn EndpointFactory>,
    ) {
        let table = match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        };
        table.insert(scheme.into(), factory);
    }

    pub fn provider(&self, path: &str) -> Option<Arc<dyn ProviderModule>> {
        self.providers.get(path).cloned()
    }

    pub fn component(&self, path: &str) -> Option<Arc<dyn ComponentFactory>> {
        self.components.get(path).cloned()
    }

    pub fn endpoint(&self, direction: Direction, scheme: &str) -> Option<Arc<dyn EndpointFactory>> {
        match direction {
            Direction::Input => self.inputs.get(scheme).cloned(),
            Direction::Output => self.outputs.get(scheme).cloned(),
        }
    }

    /// Registered provider paths, sorted.
    pub fn provider_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Registered component paths, sorted.
    pub fn component_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.components.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}
