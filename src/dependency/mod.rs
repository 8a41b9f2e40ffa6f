//! Dependency manager: resolves named providers into shared instances.
//!
//! Providers are looked up by `(provides, name)`; the first matching entry in
//! the provider list wins. A request without a name matches the first
//! provider of that kind. Singleton instances are cached per process under
//! `<provides>:<name>`.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kued::catalog::ModuleCatalog;
//! use kued::config::{DependencyRequest, ProviderConfig};
//! use kued::dependency::DependencyManager;
//! use kued::queue::Queue;
//!
//! let providers = vec![ProviderConfig::module("kue", "kued/providers/memory-queue")];
//! let manager = DependencyManager::new(providers, Arc::new(ModuleCatalog::with_builtins()))?;
//!
//! let queue: Arc<dyn Queue> = manager.require(&DependencyRequest::new("kue"))?;
//! ```

mod provider;

pub use provider::{
    into_instance, FactoryContext, Instance, ProviderMode, ProviderModule, ProviderOptions,
    ProviderRef,
};

use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::catalog::ModuleCatalog;
use crate::config::{DependencyRequest, ProviderConfig, DEFAULT_PROVIDER_NAME};
use crate::error::DependencyError;
use crate::logger::{default_logger, Logger};
use crate::providers::TracingLoggerProvider;
use provider::StaticValue;

/// Provider kind of the logger.
pub const LOGGER_PROVIDER: &str = "logger";

/// Registry and resolver of provider instances.
pub struct DependencyManager {
    providers: Vec<ProviderConfig>,
    catalog: Arc<ModuleCatalog>,
    singletons: Mutex<HashMap<String, Instance>>,
    logger: Arc<dyn Logger>,
}

impl DependencyManager {
    /// Creates a manager over a provider list and bootstraps the logger.
    ///
    /// When the list has no `logger` provider, a default tracing-backed one
    /// is appended and resolved immediately.
    ///
    /// # Errors
    ///
    /// Returns a `DependencyError` if an explicitly configured logger
    /// provider cannot be resolved.
    pub fn new(
        providers: Vec<ProviderConfig>,
        catalog: Arc<ModuleCatalog>,
    ) -> Result<Self, DependencyError> {
        let mut manager = Self {
            providers,
            catalog,
            singletons: Mutex::new(HashMap::new()),
            logger: default_logger(),
        };
        manager.initialize_logger()?;
        Ok(manager)
    }

    fn initialize_logger(&mut self) -> Result<(), DependencyError> {
        let request = DependencyRequest::new(LOGGER_PROVIDER);

        if self.find_provider_configuration(&request).is_none() {
            self.providers.push(
                ProviderConfig::new(LOGGER_PROVIDER, ProviderRef::factory(TracingLoggerProvider))
                    .with_name(DEFAULT_PROVIDER_NAME),
            );
        }

        let instance = self
            .get_instance(&request)?
            .ok_or_else(|| DependencyError::EmptyInstance(request.instance_id()))?;
        let logger = instance
            .downcast_ref::<Arc<dyn Logger>>()
            .cloned()
            .ok_or_else(|| DependencyError::TypeMismatch {
                id: request.instance_id(),
                expected: type_name::<Arc<dyn Logger>>(),
            })?;

        self.set_singleton(&request.instance_id(), instance);
        self.logger = logger;
        Ok(())
    }

    /// The process logger. Always present after construction.
    pub fn get_logger(&self) -> Arc<dyn Logger> {
        Arc::clone(&self.logger)
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        &self.providers
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    pub fn get_singleton(&self, id: &str) -> Option<Instance> {
        self.singletons
            .lock()
            .ok()
            .and_then(|singletons| singletons.get(id).cloned())
    }

    pub fn set_singleton(&self, id: &str, instance: Instance) {
        if let Ok(mut singletons) = self.singletons.lock() {
            singletons.insert(id.to_string(), instance);
        }
    }

    /// Snapshot of every cached singleton.
    pub fn singletons(&self) -> Vec<(String, Instance)> {
        self.singletons
            .lock()
            .map(|singletons| {
                singletons
                    .iter()
                    .map(|(id, instance)| (id.clone(), Arc::clone(instance)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Locate the provider configuration serving a request.
    pub fn find_provider_configuration(
        &self,
        request: &DependencyRequest,
    ) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| {
            provider.provides == request.provider
                && match &request.name {
                    Some(name) => provider.name_or_default() == name,
                    None => true,
                }
        })
    }

    fn load_provider_module(&self, require: &ProviderRef) -> Option<Arc<dyn ProviderModule>> {
        match require {
            ProviderRef::Module(path) => self.catalog.provider(path),
            ProviderRef::Factory(module) => Some(Arc::clone(module)),
            ProviderRef::Value(value) => Some(Arc::new(StaticValue(Arc::clone(value)))),
        }
    }

    /// Resolve a request to an instance.
    ///
    /// Returns `Ok(None)` only for an optional request with no matching
    /// provider; that outcome is never cached.
    ///
    /// # Errors
    ///
    /// - `MissingProvider` when a required provider is not configured
    /// - `InvalidRequest` / `InvalidProvider` on malformed shapes
    /// - `ModuleNotFound` when the module reference is not in the catalog
    /// - `UnknownMode` when the module declares a mode other than
    ///   factory|class|static
    /// - `EmptyInstance` when construction produced nothing
    pub fn get_instance(
        &self,
        request: &DependencyRequest,
    ) -> Result<Option<Instance>, DependencyError> {
        if request.provider.trim().is_empty() {
            return Err(DependencyError::InvalidRequest(
                "\"provider\" is required".to_string(),
            ));
        }
        if matches!(&request.name, Some(name) if name.trim().is_empty()) {
            return Err(DependencyError::InvalidRequest(
                "\"name\" must not be empty".to_string(),
            ));
        }

        let id = request.instance_id();

        let Some(config) = self.find_provider_configuration(request) else {
            if request.optional {
                return Ok(None);
            }
            return Err(DependencyError::MissingProvider(id));
        };

        config
            .validate()
            .map_err(|reason| DependencyError::InvalidProvider {
                id: id.clone(),
                reason,
            })?;

        let module = self.load_provider_module(&config.require).ok_or_else(|| {
            DependencyError::ModuleNotFound {
                module: config.require.describe(),
                id: id.clone(),
            }
        })?;

        let options = module.options();
        let singleton = options.is_singleton();

        if singleton {
            if let Some(instance) = self.get_singleton(&id) {
                return Ok(Some(instance));
            }
        }

        let mode = options
            .mode()
            .map_err(|mode| DependencyError::UnknownMode {
                mode,
                id: id.clone(),
            })?;

        debug!(provider = %id, mode = %mode, singleton, "Constructing provider instance");

        let instance = match mode {
            ProviderMode::Factory => {
                let manager = module.uses_dependency_manager().then_some(self);
                let ctx = FactoryContext::new(config, self.get_logger(), manager);
                module.create(&ctx)?
            }
            ProviderMode::Class => module.construct(config, self.get_logger())?,
            ProviderMode::Static => module.value(),
        };

        let instance = instance.ok_or_else(|| DependencyError::EmptyInstance(id.clone()))?;

        if singleton {
            self.set_singleton(&id, Arc::clone(&instance));
        }

        Ok(Some(instance))
    }

    /// Resolve and downcast to the handle type the provider stores,
    /// e.g. `Arc<dyn Queue>`.
    pub fn resolve<T>(&self, request: &DependencyRequest) -> Result<Option<T>, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.get_instance(request)? {
            None => Ok(None),
            Some(instance) => instance.downcast_ref::<T>().cloned().map(Some).ok_or_else(|| {
                DependencyError::TypeMismatch {
                    id: request.instance_id(),
                    expected: type_name::<T>(),
                }
            }),
        }
    }

    /// Like [`resolve`](Self::resolve), but a missing instance is an error
    /// even for optional requests.
    pub fn require<T>(&self, request: &DependencyRequest) -> Result<T, DependencyError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.resolve(request)?
            .ok_or_else(|| DependencyError::MissingProvider(request.instance_id()))
    }
}
