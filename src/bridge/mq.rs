//! External message queue bridge endpoints (`imq:<queue>`).
//!
//! The input polls on a cron schedule: reserve a batch, forward every
//! message with bounded parallelism, then delete only the reservations that
//! were forwarded. Failures are logged; the batch itself never fails.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cron::Schedule;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    parse_endpoint, BridgeError, BridgeInput, BridgeOutput, Endpoint, EndpointFactory,
    HandlerSlot, MessageHandler,
};
use crate::component::ResolvedDependencies;
use crate::config::{BridgeConfig, DependencyRequest};
use crate::dependency::LOGGER_PROVIDER;
use crate::error::{ComponentError, JobError};
use crate::logger::Logger;
use crate::mq::{MessageQueue, ReservedMessage};
use crate::worker::{tick_handler, CronTimer};

/// Provider kind of the external message queue client.
pub const MQ_PROVIDER: &str = "imq";

/// Messages forwarded concurrently within one batch.
const FORWARD_PARALLELISM: usize = 10;

/// `options.imq` of a bridge whose input is an external queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImqInputOptions {
    pub cron_time: String,
    pub messages_per_request: u32,
    /// Reservation timeout in seconds.
    pub timeout: u64,
}

impl Default for ImqInputOptions {
    fn default() -> Self {
        Self {
            cron_time: "0 * * * * *".to_string(),
            messages_per_request: 100,
            timeout: 1,
        }
    }
}

/// Decode a message body, falling back to the raw string.
fn parse_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

struct Poller {
    queue_name: String,
    options: ImqInputOptions,
    client: Arc<dyn MessageQueue>,
    handler: HandlerSlot,
    logger: Arc<dyn Logger>,
}

impl Poller {
    /// One reserve/forward/delete round; returns the number acknowledged.
    async fn poll(&self) -> usize {
        let Some(handler) = self.handler.get() else {
            self.logger.error(
                "No message handler was set. Who am I supposed to provide this message to?",
            );
            return 0;
        };

        let messages = match self
            .client
            .reserve(
                &self.queue_name,
                self.options.messages_per_request,
                Duration::from_secs(self.options.timeout),
            )
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                self.logger.error(&format!("Could not retrieve messages from IronMQ: {}", e));
                return 0;
            }
        };

        let forwarded: Vec<ReservedMessage> = stream::iter(messages)
            .map(|message| {
                let handler = Arc::clone(&handler);
                let logger = Arc::clone(&self.logger);
                async move {
                    match handler(parse_body(&message.body)).await {
                        Ok(()) => Some(message),
                        Err(e) => {
                            logger.error(&format!("Error dispatching message: {}", e));
                            None
                        }
                    }
                }
            })
            .buffer_unordered(FORWARD_PARALLELISM)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;

        match self
            .client
            .delete_reserved(&self.queue_name, &forwarded)
            .await
        {
            Ok(()) => {
                self.logger.debug(&format!(
                    "Deleted {} messages from IronMQ.",
                    forwarded.len()
                ));
                forwarded.len()
            }
            Err(e) => {
                self.logger.error(&format!("Could not delete messages: {}", e));
                0
            }
        }
    }
}

/// Polls an external queue on a schedule.
pub struct ImqInput {
    poller: Arc<Poller>,
    timer: CronTimer,
}

impl ImqInput {
    pub fn new(
        config: &BridgeConfig,
        logger: Arc<dyn Logger>,
        client: Arc<dyn MessageQueue>,
    ) -> Result<Self, BridgeError> {
        let (_, queue_name) = parse_endpoint(&config.input)?;
        let options: ImqInputOptions = config
            .section("imq")
            .map_err(|e| BridgeError::InvalidOptions(e.to_string()))?;
        let schedule = Schedule::from_str(&options.cron_time).map_err(|e| {
            BridgeError::InvalidOptions(format!("cronTime '{}': {}", options.cron_time, e))
        })?;

        let poller = Arc::new(Poller {
            queue_name: queue_name.to_string(),
            options,
            client,
            handler: HandlerSlot::default(),
            logger: Arc::clone(&logger),
        });

        let tick_poller = Arc::clone(&poller);
        let timer = CronTimer::new(
            schedule,
            tick_handler(move || {
                let poller = Arc::clone(&tick_poller);
                async move {
                    poller.poll().await;
                }
            }),
            logger,
        );

        Ok(Self { poller, timer })
    }

    pub fn queue_name(&self) -> &str {
        &self.poller.queue_name
    }

    pub fn options(&self) -> &ImqInputOptions {
        &self.poller.options
    }

    /// Run one polling round now.
    pub async fn tick(&self) -> usize {
        self.poller.poll().await
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }
}

#[async_trait]
impl BridgeInput for ImqInput {
    fn on_message(&self, handler: MessageHandler) {
        self.poller.handler.set(handler);
    }

    async fn start(&self) -> Result<(), BridgeError> {
        self.timer.start();
        Ok(())
    }

    async fn stop(&self) -> Result<(), BridgeError> {
        self.timer.stop();
        Ok(())
    }
}

/// Posts every message to an external queue.
pub struct ImqOutput {
    queue_name: String,
    client: Arc<dyn MessageQueue>,
    logger: Arc<dyn Logger>,
}

impl ImqOutput {
    pub fn new(
        config: &BridgeConfig,
        logger: Arc<dyn Logger>,
        client: Arc<dyn MessageQueue>,
    ) -> Result<Self, BridgeError> {
        let (_, queue_name) = parse_endpoint(&config.output)?;
        Ok(Self {
            queue_name: queue_name.to_string(),
            client,
            logger,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl BridgeOutput for ImqOutput {
    async fn dispatch(&self, message: Value) -> Result<(), JobError> {
        let body = match message {
            Value::String(s) => s,
            other => other.to_string(),
        };

        match self.client.post(&self.queue_name, body).await {
            Ok(()) => {
                self.logger.debug(&format!(
                    "Forwarded message to queue \"{}\"",
                    self.queue_name
                ));
                Ok(())
            }
            Err(e) => {
                self.logger.error(&format!(
                    "Error forwarding message to queue \"{}\": {}",
                    self.queue_name, e
                ));
                Err(JobError::Dispatch(e.to_string()))
            }
        }
    }
}

fn mq_dependencies() -> Vec<DependencyRequest> {
    vec![
        DependencyRequest::new(LOGGER_PROVIDER),
        DependencyRequest::new(MQ_PROVIDER),
    ]
}

/// Input factory for the `imq` scheme.
pub struct ImqInputFactory;

impl EndpointFactory for ImqInputFactory {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        mq_dependencies()
    }

    fn create(
        &self,
        config: &BridgeConfig,
        deps: &ResolvedDependencies,
    ) -> Result<Endpoint, ComponentError> {
        let input = ImqInput::new(config, deps.logger(), deps.require(MQ_PROVIDER)?)?;
        Ok(Endpoint::input(Arc::new(input)))
    }
}

/// Output factory for the `imq` scheme.
pub struct ImqOutputFactory;

impl EndpointFactory for ImqOutputFactory {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        mq_dependencies()
    }

    fn create(
        &self,
        config: &BridgeConfig,
        deps: &ResolvedDependencies,
    ) -> Result<Endpoint, ComponentError> {
        let output = ImqOutput::new(config, deps.logger(), deps.require(MQ_PROVIDER)?)?;
        Ok(Endpoint::output(Arc::new(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::message_handler;
    use crate::logger::testing::RecordingLogger;
    use crate::mq::testing::StubMessageQueue;
    use serde_json::json;
    use std::sync::Mutex;

    fn input(stub: Arc<StubMessageQueue>) -> ImqInput {
        ImqInput::new(
            &BridgeConfig::new("relay", "imq:test-queue", "kue:out"),
            Arc::new(RecordingLogger::default()),
            stub,
        )
        .expect("input")
    }

    #[test]
    fn test_input_parses_queue_name_and_defaults() {
        let input = input(Arc::new(StubMessageQueue::default()));
        assert_eq!(input.queue_name(), "test-queue");
        assert_eq!(input.options(), &ImqInputOptions::default());
        assert!(!input.is_running());
    }

    #[test]
    fn test_input_rejects_bad_schedule() {
        let config = BridgeConfig::new("relay", "imq:q", "kue:out")
            .with_options(json!({ "imq": { "cronTime": "whenever" } }));
        let result = ImqInput::new(
            &config,
            Arc::new(RecordingLogger::default()),
            Arc::new(StubMessageQueue::default()),
        );
        assert!(matches!(result, Err(BridgeError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn test_tick_forwards_and_acknowledges() {
        let stub = Arc::new(StubMessageQueue::with_messages(
            "test-queue",
            &["{\"foo\":\"bar\"}", "plain text"],
        ));
        let input = input(stub.clone());

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        input.on_message(message_handler(move |message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().expect("lock").push(message);
                Ok(())
            }
        }));

        assert_eq!(input.tick().await, 2);

        let mut received = received.lock().expect("lock").clone();
        received.sort_by_key(|v| v.to_string());
        assert_eq!(received, vec![json!("plain text"), json!({ "foo": "bar" })]);

        let mut deleted = stub.deleted_ids();
        deleted.sort();
        assert_eq!(deleted, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[tokio::test]
    async fn test_only_forwarded_messages_are_acknowledged() {
        let stub = Arc::new(StubMessageQueue::with_messages(
            "test-queue",
            &["{\"foo\":\"bar\"}", "{\"foo\":\"baz\"}"],
        ));
        let input = input(stub.clone());

        input.on_message(message_handler(|message| async move {
            if message["foo"] == "baz" {
                Err(JobError::Dispatch("Oh no!".to_string()))
            } else {
                Ok(())
            }
        }));

        assert_eq!(input.tick().await, 1);
        assert_eq!(stub.deleted_ids(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_tick_without_handler_reserves_nothing() {
        let stub = Arc::new(StubMessageQueue::with_messages("test-queue", &["1"]));
        let input = input(stub.clone());

        assert_eq!(input.tick().await, 0);
        assert!(stub.deleted_ids().is_empty());
        assert_eq!(stub.pending.lock().expect("lock")["test-queue"].len(), 1);
    }

    #[tokio::test]
    async fn test_output_posts_strings_raw_and_values_as_json() {
        let stub = Arc::new(StubMessageQueue::default());
        let output = ImqOutput::new(
            &BridgeConfig::new("relay", "kue:in", "imq:test-queue"),
            Arc::new(RecordingLogger::default()),
            stub.clone(),
        )
        .expect("output");

        assert_eq!(output.queue_name(), "test-queue");
        output.dispatch(json!({ "foo": "bar" })).await.expect("posted");
        output.dispatch(json!("raw")).await.expect("posted");

        let posted = stub.posted.lock().expect("lock").clone();
        assert_eq!(
            posted,
            vec![
                ("test-queue".to_string(), "{\"foo\":\"bar\"}".to_string()),
                ("test-queue".to_string(), "raw".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_output_failure_fails_dispatch() {
        let stub = Arc::new(StubMessageQueue::default());
        stub.failing_posts
            .lock()
            .expect("lock")
            .insert("test-queue".to_string());
        let output = ImqOutput::new(
            &BridgeConfig::new("relay", "kue:in", "imq:test-queue"),
            Arc::new(RecordingLogger::default()),
            stub,
        )
        .expect("output");

        assert!(matches!(
            output.dispatch(json!(1)).await,
            Err(JobError::Dispatch(_))
        ));
    }
}
