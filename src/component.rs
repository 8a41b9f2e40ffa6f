//! Components: the workers and bridges a workgroup runs.
//!
//! A [`ComponentFactory`] lists the providers a component depends on and
//! builds it from the resolved instances. [`load_component`] drives the whole
//! sequence: resolve dependencies, construct, then `init()`.

use std::any::type_name;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::catalog::ModuleCatalog;
use crate::config::{instance_id, DependencyRequest, WorkerConfig};
use crate::dependency::{DependencyManager, Instance, LOGGER_PROVIDER};
use crate::error::{ComponentError, DependencyError};
use crate::logger::Logger;

/// A running worker or bridge.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Called once after construction; registers handlers and starts timers.
    async fn init(&self) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Builds a component from its options and resolved dependencies.
pub trait ComponentFactory: Send + Sync {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        Vec::new()
    }

    fn create(
        &self,
        name: &str,
        options: &Value,
        deps: &ResolvedDependencies,
    ) -> Result<Arc<dyn Component>, ComponentError>;
}

/// Instances resolved for a component's dependency list, in request order.
pub struct ResolvedDependencies {
    entries: Vec<(DependencyRequest, Option<Instance>)>,
    logger: Arc<dyn Logger>,
}

impl ResolvedDependencies {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            entries: Vec::new(),
            logger,
        }
    }

    /// Resolve every request through the manager.
    pub fn resolve(
        manager: &DependencyManager,
        requests: &[DependencyRequest],
    ) -> Result<Self, DependencyError> {
        let mut resolved = Self::new(manager.get_logger());
        for request in requests {
            let instance = manager.get_instance(request)?;
            if request.provider == LOGGER_PROVIDER {
                if let Some(logger) = instance
                    .as_ref()
                    .and_then(|i| i.downcast_ref::<Arc<dyn Logger>>())
                {
                    resolved.logger = Arc::clone(logger);
                }
            }
            resolved.entries.push((request.clone(), instance));
        }
        Ok(resolved)
    }

    /// Add an already-resolved instance.
    pub fn with(mut self, provider: &str, instance: Instance) -> Self {
        self.entries
            .push((DependencyRequest::new(provider), Some(instance)));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        Arc::clone(&self.logger)
    }

    /// First instance resolved for `provider`, whatever its name, downcast
    /// to `T`.
    pub fn optional<T>(&self, provider: &str) -> Result<Option<T>, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.find(|request| request.provider == provider)
    }

    pub fn require<T>(&self, provider: &str) -> Result<T, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.optional(provider)?
            .ok_or_else(|| DependencyError::MissingProvider(provider.to_string()))
    }

    /// Instance resolved for `(provider, name)`; `None` selects the
    /// `default` name.
    pub fn named<T>(
        &self,
        provider: &str,
        name: Option<&str>,
    ) -> Result<Option<T>, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = instance_id(provider, name);
        self.find(|request| request.instance_id() == id)
    }

    pub fn require_named<T>(
        &self,
        provider: &str,
        name: Option<&str>,
    ) -> Result<T, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.named(provider, name)?
            .ok_or_else(|| DependencyError::MissingProvider(instance_id(provider, name)))
    }

    /// Instance resolved for the `index`-th declared dependency.
    pub fn get<T>(&self, index: usize) -> Result<Option<T>, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.entries.get(index) {
            Some((request, Some(instance))) => downcast(request, instance).map(Some),
            _ => Ok(None),
        }
    }

    fn find<T>(
        &self,
        matches: impl Fn(&DependencyRequest) -> bool,
    ) -> Result<Option<T>, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.entries.iter().find(|(request, _)| matches(request)) {
            Some((request, Some(instance))) => downcast(request, instance).map(Some),
            _ => Ok(None),
        }
    }
}

fn downcast<T>(request: &DependencyRequest, instance: &Instance) -> Result<T, DependencyError>
where
    T: Clone + Send + Sync + 'static,
{
    instance
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| DependencyError::TypeMismatch {
            id: request.instance_id(),
            expected: type_name::<T>(),
        })
}

/// Resolve, construct and initialize a component.
pub async fn load_component(
    manager: &DependencyManager,
    factory: &dyn ComponentFactory,
    name: &str,
    options: &Value,
) -> Result<Arc<dyn Component>, ComponentError> {
    let deps = ResolvedDependencies::resolve(manager, &factory.dependencies())?;
    debug!(component = %name, dependencies = deps.len(), "Constructing component");

    let component = factory.create(name, options, &deps)?;
    component.init().await?;
    Ok(component)
}

/// Load a worker through the factory its `require` names.
pub async fn load_worker(
    manager: &DependencyManager,
    catalog: &ModuleCatalog,
    config: &WorkerConfig,
) -> Result<Arc<dyn Component>, ComponentError> {
    let factory = catalog
        .component(&config.require)
        .ok_or_else(|| ComponentError::ModuleNotFound(config.require.clone()))?;

    load_component(manager, factory.as_ref(), &config.name, &config.options).await
}
