//! Workers shipped with the framework, registered under `kued/workers/`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::cron::{tick_handler, CronWorker};
use super::Worker;
use crate::component::{Component, ComponentFactory, ResolvedDependencies};
use crate::config::DependencyRequest;
use crate::error::ComponentError;
use crate::queue::job_handler;

#[derive(Debug, Deserialize)]
struct DumperOptions {
    #[serde(default = "default_dumper_topic")]
    topic: String,
}

fn default_dumper_topic() -> String {
    "dumper".to_string()
}

/// Logs every payload delivered on its topic.
pub struct DumperWorker {
    worker: Worker,
    topic: String,
}

impl DumperWorker {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Component for DumperWorker {
    fn name(&self) -> &str {
        self.worker.name()
    }

    async fn init(&self) -> Result<(), ComponentError> {
        let logger = Arc::clone(self.worker.logger());
        self.worker
            .process(
                &self.topic,
                1,
                job_handler(move |job, _ctx| {
                    let logger = Arc::clone(&logger);
                    async move {
                        logger.info(&format!("Got message from the ether: {}", job.data));
                        Ok(())
                    }
                }),
            )
            .await?;
        Ok(())
    }
}

/// `kued/workers/dumper`
pub struct DumperWorkerFactory;

impl ComponentFactory for DumperWorkerFactory {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        Worker::dependencies()
    }

    fn create(
        &self,
        name: &str,
        options: &Value,
        deps: &ResolvedDependencies,
    ) -> Result<Arc<dyn Component>, ComponentError> {
        let worker = Worker::from_dependencies(name, options, deps)?;
        let DumperOptions { topic } = worker.parse_options()?;
        Ok(Arc::new(DumperWorker { worker, topic }))
    }
}

/// `kued/workers/hello`: a cron worker whose tick logs `Hello!`.
pub struct HelloWorkerFactory;

impl ComponentFactory for HelloWorkerFactory {
    fn dependencies(&self) -> Vec<DependencyRequest> {
        Worker::dependencies()
    }

    fn create(
        &self,
        name: &str,
        options: &Value,
        deps: &ResolvedDependencies,
    ) -> Result<Arc<dyn Component>, ComponentError> {
        let worker = Worker::from_dependencies(name, options, deps)?;
        let logger = Arc::clone(worker.logger());
        let tick = tick_handler(move || {
            let logger = Arc::clone(&logger);
            async move { logger.info("Hello!") }
        });

        Ok(Arc::new(CronWorker::from_worker_options(worker, tick)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::into_instance;
    use crate::logger::testing::RecordingLogger;
    use crate::logger::Logger;
    use crate::queue::{Job, JobContext, Queue};
    use crate::worker::testing::CapturingQueue;
    use serde_json::json;
    use tracing::Level;

    fn deps(logger: Arc<RecordingLogger>, queue: Arc<CapturingQueue>) -> ResolvedDependencies {
        let logger: Arc<dyn Logger> = logger;
        let queue: Arc<dyn Queue> = queue;
        ResolvedDependencies::new(Arc::clone(&logger))
            .with("logger", into_instance(logger))
            .with("kue", into_instance(queue))
    }

    #[tokio::test]
    async fn test_dumper_logs_payloads() {
        let logger = Arc::new(RecordingLogger::default());
        let queue = Arc::new(CapturingQueue::default());

        let dumper = DumperWorkerFactory
            .create("dumper", &json!({}), &deps(logger.clone(), queue.clone()))
            .expect("dumper");
        dumper.init().await.expect("init");

        let handler = queue.handler("dumper").expect("registered on default topic");
        handler(
            Job::new("dumper", json!({ "hello": "world" })),
            JobContext {
                topic: "dumper".to_string(),
                consumer: "dumper-0".to_string(),
                attempt: 1,
            },
        )
        .await
        .expect("handled");

        assert!(logger.contains(Level::INFO, "Got message from the ether"));
        assert!(logger.contains(Level::INFO, "world"));
    }

    #[tokio::test]
    async fn test_dumper_topic_option() {
        let queue = Arc::new(CapturingQueue::default());
        let dumper = DumperWorkerFactory
            .create(
                "dumper",
                &json!({ "topic": "audit" }),
                &deps(Arc::new(RecordingLogger::default()), queue.clone()),
            )
            .expect("dumper");
        dumper.init().await.expect("init");

        assert!(queue.handler("audit").is_some());
    }

    #[test]
    fn test_hello_requires_cron_options() {
        let deps = deps(
            Arc::new(RecordingLogger::default()),
            Arc::new(CapturingQueue::default()),
        );

        assert!(HelloWorkerFactory.create("hello", &json!({}), &deps).is_err());
        assert!(HelloWorkerFactory
            .create("hello", &json!({ "cron": { "cronTime": "*/5 * * * * *" } }), &deps)
            .is_ok());
    }
}
