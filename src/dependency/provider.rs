//! Provider modules and the references that point at them.
//!
//! A provider configuration names its implementation through a
//! [`ProviderRef`]:
//!
//! - `Module(path)`: looked up in the [`ModuleCatalog`](crate::catalog::ModuleCatalog);
//!   the only form that survives the trip to a child process.
//! - `Factory(module)`: an inline [`ProviderModule`].
//! - `Value(instance)`: an inline, already-constructed value (static mode).
//!
//! Modules declare how they are constructed through [`ProviderOptions`]:
//! `factory` (default) calls [`ProviderModule::create`], `class` calls
//! [`ProviderModule::construct`], `static` returns [`ProviderModule::value`].

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::DependencyManager;
use crate::config::ProviderConfig;
use crate::error::DependencyError;
use crate::logger::Logger;

/// A resolved provider value.
///
/// Trait-object providers are stored as their shared handle, e.g. an
/// `Arc<dyn Queue>` is the `Any` value inside the instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a provider instance.
pub fn into_instance<T: Any + Send + Sync>(value: T) -> Instance {
    Arc::new(value)
}

/// How a provider module builds its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Factory,
    Class,
    Static,
}

impl FromStr for ProviderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "factory" => Ok(Self::Factory),
            "class" => Ok(Self::Class),
            "static" => Ok(Self::Static),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factory => write!(f, "factory"),
            Self::Class => write!(f, "class"),
            Self::Static => write!(f, "static"),
        }
    }
}

/// Options a provider module attaches to itself.
///
/// The mode is kept as a raw string so an unknown value surfaces as a
/// configuration error at resolution time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    pub mode: Option<String>,
    pub singleton: Option<bool>,
}

impl ProviderOptions {
    pub fn factory() -> Self {
        Self::with_mode("factory")
    }

    pub fn class() -> Self {
        Self::with_mode("class")
    }

    pub fn static_value() -> Self {
        Self::with_mode("static")
    }

    pub fn with_mode(mode: impl Into<String>) -> Self {
        Self {
            mode: Some(mode.into()),
            singleton: None,
        }
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = Some(singleton);
        self
    }

    /// Singleton unless explicitly disabled.
    pub fn is_singleton(&self) -> bool {
        self.singleton.unwrap_or(true)
    }

    /// Parsed mode; `factory` when unset.
    pub fn mode(&self) -> Result<ProviderMode, String> {
        match &self.mode {
            Some(mode) => mode.parse(),
            None => Ok(ProviderMode::Factory),
        }
    }
}

/// Arguments handed to a factory-mode provider.
pub struct FactoryContext<'a> {
    pub config: &'a ProviderConfig,
    pub logger: Arc<dyn Logger>,
    manager: Option<&'a DependencyManager>,
}

impl<'a> FactoryContext<'a> {
    pub(crate) fn new(
        config: &'a ProviderConfig,
        logger: Arc<dyn Logger>,
        manager: Option<&'a DependencyManager>,
    ) -> Self {
        Self {
            config,
            logger,
            manager,
        }
    }

    /// The dependency manager, present when the module asked for it through
    /// [`ProviderModule::uses_dependency_manager`].
    pub fn manager(&self) -> Result<&'a DependencyManager, DependencyError> {
        self.manager
            .ok_or_else(|| DependencyError::ManagerUnavailable(self.config.instance_id()))
    }

    /// Deserialize the provider's `options` block.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, DependencyError> {
        self.config.parse_options()
    }
}

/// A provider implementation registered in the catalog or inlined in a
/// provider configuration.
pub trait ProviderModule: Send + Sync {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::default()
    }

    /// Ask for the dependency manager to be injected before `create`, for
    /// providers that pull further dependencies lazily.
    fn uses_dependency_manager(&self) -> bool {
        false
    }

    /// Factory mode.
    fn create(&self, _ctx: &FactoryContext<'_>) -> Result<Option<Instance>, DependencyError> {
        Ok(None)
    }

    /// Class mode.
    fn construct(
        &self,
        _config: &ProviderConfig,
        _logger: Arc<dyn Logger>,
    ) -> Result<Option<Instance>, DependencyError> {
        Ok(None)
    }

    /// Static mode.
    fn value(&self) -> Option<Instance> {
        None
    }
}

/// Module wrapping an inline value.
pub(crate) struct StaticValue(pub Instance);

impl ProviderModule for StaticValue {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::static_value().singleton(true)
    }

    fn value(&self) -> Option<Instance> {
        Some(Arc::clone(&self.0))
    }
}

/// Reference from a provider configuration to its implementation.
#[derive(Clone)]
pub enum ProviderRef {
    Module(String),
    Factory(Arc<dyn ProviderModule>),
    Value(Instance),
}

impl ProviderRef {
    pub fn module(path: impl Into<String>) -> Self {
        Self::Module(path.into())
    }

    pub fn factory<M: ProviderModule + 'static>(module: M) -> Self {
        Self::Factory(Arc::new(module))
    }

    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::Value(into_instance(value))
    }

    /// Human-readable description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Module(path) => path.clone(),
            Self::Factory(_) => "<inline factory>".to_string(),
            Self::Value(_) => "<inline value>".to_string(),
        }
    }
}

impl fmt::Debug for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(path) => f.debug_tuple("Module").field(path).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
            Self::Value(_) => f.write_str("Value(..)"),
        }
    }
}

impl Serialize for ProviderRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Module(path) => serializer.serialize_str(path),
            _ => Err(serde::ser::Error::custom(
                "inline provider references cannot cross a process boundary",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for ProviderRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        Ok(Self::Module(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("factory".parse::<ProviderMode>(), Ok(ProviderMode::Factory));
        assert_eq!("class".parse::<ProviderMode>(), Ok(ProviderMode::Class));
        assert_eq!("static".parse::<ProviderMode>(), Ok(ProviderMode::Static));
        assert_eq!(
            "prototype".parse::<ProviderMode>(),
            Err("prototype".to_string())
        );
    }

    #[test]
    fn test_options_defaults() {
        let options = ProviderOptions::default();
        assert!(options.is_singleton());
        assert_eq!(options.mode(), Ok(ProviderMode::Factory));

        let options = ProviderOptions::class().singleton(false);
        assert!(!options.is_singleton());
        assert_eq!(options.mode(), Ok(ProviderMode::Class));
    }

    #[test]
    fn test_provider_ref_serialization() {
        let module = ProviderRef::module("kued/providers/redis-queue");
        let json = serde_json::to_string(&module).expect("module refs serialize");
        assert_eq!(json, "\"kued/providers/redis-queue\"");

        let parsed: ProviderRef = serde_json::from_str(&json).expect("parse");
        assert!(matches!(parsed, ProviderRef::Module(p) if p == "kued/providers/redis-queue"));

        let inline = ProviderRef::value(42u32);
        assert!(serde_json::to_string(&inline).is_err());
    }
}
