//! Bridges relay messages from an input endpoint to an output endpoint.
//!
//! Endpoints are addressed as `<scheme>:<channel>` (`kue:orders`,
//! `imq:inbound`). The scheme picks the endpoint factory from the
//! [`ModuleCatalog`]; the channel is the topic or queue name.
//!
//! A bridge forwards one message at a time and acknowledges the input only
//! with the outcome of the output's dispatch. It adds no buffering and no
//! transformation; delivery guarantees are those of the input endpoint.

pub mod mq;
pub mod queue;

pub use self::mq::{ImqInput, ImqInputFactory, ImqInputOptions, ImqOutput, ImqOutputFactory};
pub use self::queue::{
    QueueInput, QueueInputFactory, QueueInputOptions, QueueOutput, QueueOutputFactory,
    QueueOutputOptions,
};

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use crate::catalog::ModuleCatalog;
use crate::component::{Component, ResolvedDependencies};
use crate::config::{BridgeConfig, DependencyRequest};
use crate::dependency::DependencyManager;
use crate::error::{ComponentError, JobError};
use crate::logger::Logger;
use crate::metrics::MetricsCollector;
use crate::mq::MqError;
use crate::queue::QueueError;

/// Errors raised while building or running bridges.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid Bridge path specification: {0}")]
    InvalidEndpoint(String),

    #[error("Could not find {direction} module with ID {id}")]
    UnknownEndpoint { direction: Direction, id: String },

    #[error("The input endpoint does not accept a message handler")]
    NotAnInput,

    #[error("The output endpoint does not dispatch messages")]
    NotAnOutput,

    #[error("Invalid endpoint options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Mq(#[from] MqError),

    #[error("Endpoint failed: {0}")]
    Endpoint(String),
}

/// Side of a bridge an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Split `<scheme>:<channel>`.
pub fn parse_endpoint(descriptor: &str) -> Result<(&str, &str), BridgeError> {
    match descriptor.find(':') {
        Some(idx) if idx > 0 => Ok((&descriptor[..idx], &descriptor[idx + 1..])),
        _ => Err(BridgeError::InvalidEndpoint(descriptor.to_string())),
    }
}

/// Handler an input endpoint delivers each message to.
pub type MessageHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Shared slot holding the handler set through `on_message`.
#[derive(Clone, Default)]
pub(crate) struct HandlerSlot(Arc<Mutex<Option<MessageHandler>>>);

impl HandlerSlot {
    pub(crate) fn set(&self, handler: MessageHandler) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn get(&self) -> Option<MessageHandler> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Endpoint producing messages.
#[async_trait]
pub trait BridgeInput: Send + Sync {
    fn on_message(&self, handler: MessageHandler);

    async fn start(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Endpoint accepting messages.
#[async_trait]
pub trait BridgeOutput: Send + Sync {
    async fn dispatch(&self, message: Value) -> Result<(), JobError>;

    async fn start(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// A constructed endpoint and the roles it can play.
#[derive(Clone, Default)]
pub struct Endpoint {
    input: Option<Arc<dyn BridgeInput>>,
    output: Option<Arc<dyn BridgeOutput>>,
}

impl Endpoint {
    pub fn input(input: Arc<dyn BridgeInput>) -> Self {
        Self {
            input: Some(input),
            output: None,
        }
    }

    pub fn output(output: Arc<dyn BridgeOutput>) -> Self {
        Self {
            input: None,
            output: Some(output),
        }
    }

    pub fn as_input(&self) -> Option<&Arc<dyn BridgeInput>> {
        self.input.as_ref()
    }

    pub fn as_output(&self) -> Option<&Arc<dyn BridgeOutput>> {
        self.output.as_ref()
    }
}

/// Builds one side of a bridge from the bridge configuration.
pub trait EndpointFactory: Send + Sync {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        Vec::new()
    }

    fn create(
        &self,
        config: &BridgeConfig,
        deps: &ResolvedDependencies,
    ) -> Result<Endpoint, ComponentError>;
}

/// Couples one input endpoint to one output endpoint.
pub struct Bridge {
    name: String,
    logger: Arc<dyn Logger>,
    input: Arc<dyn BridgeInput>,
    output: Arc<dyn BridgeOutput>,
}

impl Bridge {
    /// Couple `input` to `output` and register as the input's handler.
    ///
    /// # Errors
    ///
    /// `NotAnInput` / `NotAnOutput` if an endpoint cannot play its role.
    pub fn new(
        name: impl Into<String>,
        logger: Arc<dyn Logger>,
        input: Endpoint,
        output: Endpoint,
    ) -> Result<Self, BridgeError> {
        let input = input.input.ok_or(BridgeError::NotAnInput)?;
        let output = output.output.ok_or(BridgeError::NotAnOutput)?;
        let name = name.into();

        let handler_output = Arc::clone(&output);
        let handler_logger = Arc::clone(&logger);
        let handler_name = name.clone();
        input.on_message(message_handler(move |message| {
            let output = Arc::clone(&handler_output);
            let logger = Arc::clone(&handler_logger);
            let name = handler_name.clone();
            async move { forward(&name, &*output, &*logger, message).await }
        }));

        Ok(Self {
            name,
            logger,
            input,
            output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward one message to the output; resolves with the output's result.
    pub async fn handle_incoming_message(&self, message: Value) -> Result<(), JobError> {
        forward(&self.name, &*self.output, &*self.logger, message).await
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        self.logger.debug("Starting bridge.");
        self.input.start().await?;
        self.output.start().await
    }

    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.logger.debug("Stopping bridge.");
        self.input.stop().await?;
        self.output.stop().await
    }
}

async fn forward(
    name: &str,
    output: &dyn BridgeOutput,
    logger: &dyn Logger,
    message: Value,
) -> Result<(), JobError> {
    logger.debug("Received message on the bridge; dispatching...");
    let result = output.dispatch(message).await;
    MetricsCollector::new().record_bridge_message(name, result.is_ok());

    match &result {
        Ok(()) => logger.debug("Message successfully dispatched."),
        Err(e) => logger.error(&format!("Error dispatching message: {}", e)),
    }
    result
}

#[async_trait]
impl Component for Bridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> Result<(), ComponentError> {
        Ok(self.start().await?)
    }

    async fn stop(&self) -> Result<(), ComponentError> {
        Ok(self.shutdown().await?)
    }
}

fn create_endpoint(
    manager: &DependencyManager,
    catalog: &ModuleCatalog,
    config: &BridgeConfig,
    direction: Direction,
) -> Result<Endpoint, ComponentError> {
    let descriptor = match direction {
        Direction::Input => &config.input,
        Direction::Output => &config.output,
    };
    let (scheme, _) = parse_endpoint(descriptor)?;

    let factory = catalog
        .endpoint(direction, scheme)
        .ok_or_else(|| BridgeError::UnknownEndpoint {
            direction,
            id: scheme.to_string(),
        })?;

    let deps = ResolvedDependencies::resolve(manager, &factory.dependencies())?;
    factory.create(config, &deps)
}

/// Build both endpoints of `config`, couple them, and start the bridge.
pub async fn load_bridge(
    manager: &DependencyManager,
    catalog: &ModuleCatalog,
    config: &BridgeConfig,
) -> Result<Arc<Bridge>, ComponentError> {
    let input = create_endpoint(manager, catalog, config, Direction::Input)?;
    let output = create_endpoint(manager, catalog, config, Direction::Output)?;

    let bridge = Arc::new(Bridge::new(
        config.name.clone(),
        manager.get_logger(),
        input,
        output,
    )?);
    bridge.init().await?;
    Ok(bridge)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Input endpoint that exposes its registered handler.
    #[derive(Default)]
    pub struct StubInput {
        pub slot: HandlerSlot,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
    }

    impl StubInput {
        pub async fn push(&self, message: Value) -> Result<(), JobError> {
            let handler = self
                .slot
                .get()
                .ok_or_else(|| JobError::NoMessageHandler("stub".to_string()))?;
            handler(message).await
        }
    }

    #[async_trait]
    impl BridgeInput for StubInput {
        fn on_message(&self, handler: MessageHandler) {
            self.slot.set(handler);
        }

        async fn start(&self) -> Result<(), BridgeError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), BridgeError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Output endpoint recording dispatched messages.
    #[derive(Default)]
    pub struct StubOutput {
        pub dispatched: Mutex<Vec<Value>>,
        pub fail_with: Mutex<Option<String>>,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
    }

    #[async_trait]
    impl BridgeOutput for StubOutput {
        async fn dispatch(&self, message: Value) -> Result<(), JobError> {
            self.dispatched.lock().expect("lock").push(message);
            match self.fail_with.lock().expect("lock").clone() {
                Some(reason) => Err(JobError::Dispatch(reason)),
                None => Ok(()),
            }
        }

        async fn start(&self) -> Result<(), BridgeError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), BridgeError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
