//! Job-queue bridge endpoints (`kue:<topic>`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::{
    parse_endpoint, BridgeError, BridgeInput, BridgeOutput, Endpoint, EndpointFactory,
    HandlerSlot, MessageHandler,
};
use crate::component::ResolvedDependencies;
use crate::config::{BridgeConfig, DependencyRequest};
use crate::dependency::LOGGER_PROVIDER;
use crate::error::{ComponentError, JobError};
use crate::logger::Logger;
use crate::queue::{job_handler, Backoff, Queue};
use crate::worker::QUEUE_PROVIDER;

/// `options.kue` of a bridge whose input is a queue topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueInputOptions {
    pub concurrency: usize,
}

impl Default for QueueInputOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// `options.kue` of a bridge whose output is a queue topic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOutputOptions {
    pub priority: i32,
    pub attempts: Option<u32>,
    pub backoff: Backoff,
    /// Milliseconds.
    pub ttl: Option<u64>,
    /// Milliseconds.
    pub delay: Option<u64>,
}

fn section<T: serde::de::DeserializeOwned>(config: &BridgeConfig) -> Result<T, BridgeError> {
    config
        .section("kue")
        .map_err(|e| BridgeError::InvalidOptions(e.to_string()))
}

/// Consumes a queue topic and hands each job's data to the bridge.
///
/// The topic is subscribed once, on the first `start`. `stop` pauses
/// delivery: consumers hold the job they picked up until the input is
/// started again.
pub struct QueueInput {
    topic: String,
    concurrency: usize,
    queue: Arc<dyn Queue>,
    logger: Arc<dyn Logger>,
    handler: HandlerSlot,
    subscribed: AtomicBool,
    running: watch::Sender<bool>,
}

impl QueueInput {
    pub fn new(
        config: &BridgeConfig,
        logger: Arc<dyn Logger>,
        queue: Arc<dyn Queue>,
    ) -> Result<Self, BridgeError> {
        let (_, topic) = parse_endpoint(&config.input)?;
        let options: QueueInputOptions = section(config)?;

        Ok(Self {
            topic: topic.to_string(),
            concurrency: options.concurrency.max(1),
            queue,
            logger,
            handler: HandlerSlot::default(),
            subscribed: AtomicBool::new(false),
            running: watch::Sender::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Dispatch one job payload to the registered handler.
    pub async fn receive_message(&self, data: Value) -> Result<(), JobError> {
        receive(&self.topic, &self.handler, &*self.logger, data).await
    }
}

async fn receive(
    topic: &str,
    slot: &HandlerSlot,
    logger: &dyn Logger,
    data: Value,
) -> Result<(), JobError> {
    let handler = slot
        .get()
        .ok_or_else(|| JobError::NoMessageHandler(topic.to_string()))?;

    match handler(data).await {
        Ok(()) => {
            logger.debug("Dispatched message to handler.");
            Ok(())
        }
        Err(e) => {
            logger.error(&format!(
                "Error occurred dispatching message to handler: {}",
                e
            ));
            Err(e)
        }
    }
}

#[async_trait]
impl BridgeInput for QueueInput {
    fn on_message(&self, handler: MessageHandler) {
        self.handler.set(handler);
    }

    /// Resume delivery, subscribing to the topic the first time.
    async fn start(&self) -> Result<(), BridgeError> {
        self.running.send_replace(true);
        if self.subscribed.swap(true, Ordering::SeqCst) {
            self.logger.debug("Resumed queue input.");
            return Ok(());
        }

        let topic = self.topic.clone();
        let slot = self.handler.clone();
        let logger = Arc::clone(&self.logger);
        let running = self.running.subscribe();

        let result = self
            .queue
            .process(
                &self.topic,
                self.concurrency,
                job_handler(move |job, _ctx| {
                    let topic = topic.clone();
                    let slot = slot.clone();
                    let logger = Arc::clone(&logger);
                    let mut running = running.clone();
                    async move {
                        let resumed = running.wait_for(|running| *running).await.is_ok();
                        if !resumed {
                            return Err(JobError::NoMessageHandler(topic));
                        }
                        receive(&topic, &slot, &*logger, job.data).await
                    }
                }),
            )
            .await;

        if let Err(e) = result {
            self.subscribed.store(false, Ordering::SeqCst);
            self.running.send_replace(false);
            return Err(e.into());
        }
        Ok(())
    }

    /// Pause delivery; the subscription stays registered.
    async fn stop(&self) -> Result<(), BridgeError> {
        self.running.send_replace(false);
        self.logger.debug("Paused queue input.");
        Ok(())
    }
}

/// Saves every message as a job on a queue topic.
pub struct QueueOutput {
    topic: String,
    options: QueueOutputOptions,
    queue: Arc<dyn Queue>,
    logger: Arc<dyn Logger>,
}

impl QueueOutput {
    pub fn new(
        config: &BridgeConfig,
        logger: Arc<dyn Logger>,
        queue: Arc<dyn Queue>,
    ) -> Result<Self, BridgeError> {
        let (_, topic) = parse_endpoint(&config.output)?;
        Ok(Self {
            topic: topic.to_string(),
            options: section(config)?,
            queue,
            logger,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn options(&self) -> &QueueOutputOptions {
        &self.options
    }
}

#[async_trait]
impl BridgeOutput for QueueOutput {
    async fn dispatch(&self, message: Value) -> Result<(), JobError> {
        let mut job = self
            .queue
            .create(self.topic.as_str(), message)
            .priority(self.options.priority)
            .attempts(self.options.attempts.unwrap_or(1))
            .backoff(self.options.backoff);
        if let Some(ttl) = self.options.ttl.filter(|ms| *ms > 0) {
            job = job.ttl(Duration::from_millis(ttl));
        }
        if let Some(delay) = self.options.delay.filter(|ms| *ms > 0) {
            job = job.delay(Duration::from_millis(delay));
        }

        match job.save().await {
            Ok(_) => {
                self.logger.debug("Forwarded message successfully.");
                Ok(())
            }
            Err(e) => {
                self.logger.error(&format!("Failed to forward message: {}", e));
                Err(JobError::Dispatch(e.to_string()))
            }
        }
    }
}

fn queue_dependencies() -> Vec<DependencyRequest> {
    vec![
        DependencyRequest::new(LOGGER_PROVIDER),
        DependencyRequest::new(QUEUE_PROVIDER),
    ]
}

/// Input factory for the `kue` scheme.
pub struct QueueInputFactory;

impl EndpointFactory for QueueInputFactory {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        queue_dependencies()
    }

    fn create(
        &self,
        config: &BridgeConfig,
        deps: &ResolvedDependencies,
    ) -> Result<Endpoint, ComponentError> {
        let input = QueueInput::new(config, deps.logger(), deps.require(QUEUE_PROVIDER)?)?;
        Ok(Endpoint::input(Arc::new(input)))
    }
}

/// Output factory for the `kue` scheme.
pub struct QueueOutputFactory;

impl EndpointFactory for QueueOutputFactory {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        queue_dependencies()
    }

    fn create(
        &self,
        config: &BridgeConfig,
        deps: &ResolvedDependencies,
    ) -> Result<Endpoint, ComponentError> {
        let output = QueueOutput::new(config, deps.logger(), deps.require(QUEUE_PROVIDER)?)?;
        Ok(Endpoint::output(Arc::new(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::message_handler;
    use crate::logger::testing::RecordingLogger;
    use crate::queue::{Job, JobContext};
    use crate::worker::testing::CapturingQueue;
    use serde_json::json;
    use std::sync::Mutex;

    fn config() -> BridgeConfig {
        BridgeConfig::new("relay", "kue:test-queue", "kue:other-queue")
    }

    #[test]
    fn test_input_parses_topic() {
        let input = QueueInput::new(
            &config().with_options(json!({ "kue": { "concurrency": 4 } })),
            Arc::new(RecordingLogger::default()),
            Arc::new(CapturingQueue::default()),
        )
        .expect("input");

        assert_eq!(input.topic(), "test-queue");
        assert_eq!(input.concurrency(), 4);
    }

    #[tokio::test]
    async fn test_input_dispatches_job_data() {
        let queue = Arc::new(CapturingQueue::default());
        let input = QueueInput::new(
            &config(),
            Arc::new(RecordingLogger::default()),
            queue.clone(),
        )
        .expect("input");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        input.on_message(message_handler(move |message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().expect("lock").push(message);
                Ok(())
            }
        }));
        input.start().await.expect("subscribed");

        assert_eq!(queue.concurrency("test-queue"), Some(1));
        let handler = queue.handler("test-queue").expect("registered");
        handler(
            Job::new("test-queue", json!({ "foo": "bar" })),
            JobContext {
                topic: "test-queue".to_string(),
                consumer: "test-queue-0".to_string(),
                attempt: 1,
            },
        )
        .await
        .expect("dispatched");

        assert_eq!(*received.lock().expect("lock"), vec![json!({ "foo": "bar" })]);
    }

    #[tokio::test]
    async fn test_input_restart_keeps_single_subscription() {
        let queue = Arc::new(CapturingQueue::default());
        let input = QueueInput::new(
            &config(),
            Arc::new(RecordingLogger::default()),
            queue.clone(),
        )
        .expect("input");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        input.on_message(message_handler(move |message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().expect("lock").push(message);
                Ok(())
            }
        }));

        input.start().await.expect("started");
        input.stop().await.expect("stopped");
        assert!(!input.is_running());

        let handler = queue.handler("test-queue").expect("registered");
        let delivery = tokio::spawn(handler(
            Job::new("test-queue", json!({ "n": 1 })),
            JobContext {
                topic: "test-queue".to_string(),
                consumer: "test-queue-0".to_string(),
                attempt: 1,
            },
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.lock().expect("lock").is_empty());

        input.start().await.expect("restarted");
        assert!(input.is_running());
        delivery.await.expect("joined").expect("dispatched");

        assert_eq!(*received.lock().expect("lock"), vec![json!({ "n": 1 })]);
        assert_eq!(queue.registrations.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_input_without_handler_fails_job() {
        let input = QueueInput::new(
            &config(),
            Arc::new(RecordingLogger::default()),
            Arc::new(CapturingQueue::default()),
        )
        .expect("input");

        let err = input
            .receive_message(json!({}))
            .await
            .expect_err("no handler");
        assert!(matches!(err, JobError::NoMessageHandler(_)));
    }

    #[tokio::test]
    async fn test_output_saves_job_with_options() {
        let queue = Arc::new(CapturingQueue::default());
        let output = QueueOutput::new(
            &config().with_options(json!({
                "kue": {
                    "priority": 5,
                    "attempts": 3,
                    "backoff": { "type": "exponential", "delay": 100 },
                    "ttl": 2000
                }
            })),
            Arc::new(RecordingLogger::default()),
            queue.clone(),
        )
        .expect("output");

        assert_eq!(output.topic(), "other-queue");
        output
            .dispatch(json!({ "foo": "bar" }))
            .await
            .expect("saved");

        let saved = queue.saved.lock().expect("lock");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].topic, "other-queue");
        assert_eq!(saved[0].data, json!({ "foo": "bar" }));
        assert_eq!(saved[0].priority, 5);
        assert_eq!(saved[0].max_attempts, 3);
        assert_eq!(saved[0].backoff, Backoff::exponential(Duration::from_millis(100)));
        assert_eq!(saved[0].ttl(), Some(Duration::from_secs(2)));
        assert_eq!(saved[0].delay(), None);
    }

    #[test]
    fn test_output_defaults() {
        let output = QueueOutput::new(
            &config(),
            Arc::new(RecordingLogger::default()),
            Arc::new(CapturingQueue::default()),
        )
        .expect("output");

        assert_eq!(output.options(), &QueueOutputOptions::default());
    }
}
