//! In-process side of a workgroup: decode the shipped configuration, build
//! the dependency manager, then construct and run the named workers and
//! bridges.

use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Value};
use thiserror::Error;

use super::notifier::{ParentNotifier, StatusMessage};
use crate::bridge::load_bridge;
use crate::catalog::ModuleCatalog;
use crate::component::{load_worker, Component};
use crate::config::{BridgeConfig, NodeConfig, WorkerConfig};
use crate::dependency::DependencyManager;
use crate::error::{ComponentError, ConfigError, DependencyError};
use crate::logger::Logger;
use crate::metrics::{export_metrics, MetricsCollector};
use crate::queue::Queue;
use crate::task_manager::CLOSE_TIMEOUT;

/// Command keyword that spawns the workgroup's components.
pub const RUN_COMMAND: &str = "run";

/// Status message types emitted by a workgroup.
pub const ERROR_EVENT: &str = "error";
pub const WORKERS_SPAWNED_EVENT: &str = "workers-spawned";
pub const METRICS_EVENT: &str = "metrics";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Expected a command and an encoded configuration")]
    MissingArguments,

    #[error("Received unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid workgroup: {0}")]
    InvalidWorkgroup(String),

    #[error("Workgroup includes workers not present in worker specification: {}", .0.join(", "))]
    MissingWorkers(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("An error occurred spawning workers and bridges for WorkGroup: {0}")]
    Spawn(#[from] ComponentError),
}

/// Names of the components a workgroup spawned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSummary {
    pub workers: Vec<String>,
    pub bridges: Vec<String>,
}

/// A workgroup's worker list split by kind.
#[derive(Debug)]
pub struct ResolvedWorkgroup<'a> {
    pub workers: Vec<&'a WorkerConfig>,
    pub bridges: Vec<&'a BridgeConfig>,
}

/// Partition `config.workgroup.workers` into worker and bridge
/// configurations.
///
/// # Errors
///
/// `MissingWorkers` naming every entry found in neither list.
pub fn resolve_workgroup(config: &NodeConfig) -> Result<ResolvedWorkgroup<'_>, SupervisorError> {
    let mut resolved = ResolvedWorkgroup {
        workers: Vec::new(),
        bridges: Vec::new(),
    };
    let mut missing = Vec::new();

    for name in &config.workgroup.workers {
        if let Some(worker) = config.find_worker(name) {
            resolved.workers.push(worker);
        } else if let Some(bridge) = config.find_bridge(name) {
            resolved.bridges.push(bridge);
        } else {
            missing.push(name.clone());
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(SupervisorError::MissingWorkers(missing))
    }
}

/// One workgroup instance running in this process.
pub struct Workgroup {
    config: NodeConfig,
    catalog: Arc<ModuleCatalog>,
    manager: Arc<DependencyManager>,
    logger: Arc<dyn Logger>,
    notifier: Arc<dyn ParentNotifier>,
    components: Mutex<Vec<Arc<dyn Component>>>,
}

impl Workgroup {
    pub fn new(
        config: NodeConfig,
        catalog: Arc<ModuleCatalog>,
        notifier: Arc<dyn ParentNotifier>,
    ) -> Result<Self, SupervisorError> {
        let manager = Arc::new(DependencyManager::new(
            config.providers.clone(),
            Arc::clone(&catalog),
        )?);
        let logger = manager.get_logger();

        Ok(Self {
            config,
            catalog,
            manager,
            logger,
            notifier,
            components: Mutex::new(Vec::new()),
        })
    }

    /// Build from `[command, encoded]` process arguments.
    ///
    /// Returns the command keyword alongside the workgroup.
    pub fn from_args(
        args: &[String],
        catalog: Arc<ModuleCatalog>,
        notifier: Arc<dyn ParentNotifier>,
    ) -> Result<(String, Self), SupervisorError> {
        let [command, encoded, ..] = args else {
            return Err(SupervisorError::MissingArguments);
        };
        let config = NodeConfig::decode(encoded)?;
        Ok((command.clone(), Self::new(config, catalog, notifier)?))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn name(&self) -> Option<&str> {
        self.config.workgroup.name.as_deref()
    }

    pub fn dependency_manager(&self) -> &Arc<DependencyManager> {
        &self.manager
    }

    /// Names of the components constructed so far.
    pub fn component_names(&self) -> Vec<String> {
        self.components
            .lock()
            .map(|components| components.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Dispatch a command keyword.
    pub async fn execute(&self, command: &str) -> Result<SpawnSummary, SupervisorError> {
        match command {
            RUN_COMMAND => self.spawn_workers().await,
            other => {
                let err = SupervisorError::UnknownCommand(other.to_string());
                self.report_error(&err.to_string(), json!({ "command": other }));
                Err(err)
            }
        }
    }

    /// Construct every worker and bridge of the workgroup concurrently.
    ///
    /// Failures are reported to the parent before being returned. A failed
    /// construction does not cancel the others; the first error is returned
    /// once all of them have finished.
    pub async fn spawn_workers(&self) -> Result<SpawnSummary, SupervisorError> {
        if let Err(reason) = self.config.workgroup.validate() {
            let err = SupervisorError::InvalidWorkgroup(reason);
            self.report_error(
                "Could not spawn workgroup; invalid configuration.",
                error_data(&err),
            );
            return Err(err);
        }

        let resolved = match resolve_workgroup(&self.config) {
            Ok(resolved) => resolved,
            Err(err) => {
                let data = match &err {
                    SupervisorError::MissingWorkers(missing) => json!({ "missing": missing }),
                    _ => Value::Null,
                };
                self.report_error(&err.to_string(), data);
                return Err(err);
            }
        };

        let mut tasks: Vec<BoxFuture<'_, Result<Arc<dyn Component>, ComponentError>>> =
            Vec::with_capacity(resolved.workers.len() + resolved.bridges.len());
        for worker in &resolved.workers {
            let worker = *worker;
            tasks.push(load_worker(&self.manager, &self.catalog, worker).boxed());
        }
        for bridge in &resolved.bridges {
            let bridge = *bridge;
            tasks.push(
                async move {
                    let bridge = load_bridge(&self.manager, &self.catalog, bridge).await?;
                    Ok(bridge as Arc<dyn Component>)
                }
                .boxed(),
            );
        }

        let mut first_error = None;
        for result in join_all(tasks).await {
            match result {
                Ok(component) => {
                    if let Ok(mut components) = self.components.lock() {
                        components.push(component);
                    }
                }
                Err(e) => {
                    self.logger.error(&format!("Failed to construct component: {}", e));
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            let err = SupervisorError::Spawn(e);
            self.report_error(
                "An error occurred spawning workers and bridges for WorkGroup.",
                error_data(&err),
            );
            return Err(err);
        }

        let summary = SpawnSummary {
            workers: resolved.workers.iter().map(|w| w.name.clone()).collect(),
            bridges: resolved.bridges.iter().map(|b| b.name.clone()).collect(),
        };
        self.report_info(
            WORKERS_SPAWNED_EVENT,
            &format!(
                "Workgroup has spawned {} workers and {} bridges",
                summary.workers.len(),
                summary.bridges.len()
            ),
            json!({ "workers": summary.workers, "bridges": summary.bridges }),
        );
        Ok(summary)
    }

    /// Stop every component, close queue singletons and send a final metrics
    /// snapshot to the parent.
    pub async fn shutdown(&self) {
        let components: Vec<Arc<dyn Component>> = self
            .components
            .lock()
            .map(|mut components| components.drain(..).rev().collect())
            .unwrap_or_default();

        for component in components {
            if let Err(e) = component.stop().await {
                self.logger.error(&format!(
                    "Error stopping component {}: {}",
                    component.name(),
                    e
                ));
            }
        }

        for (id, instance) in self.manager.singletons() {
            if let Some(queue) = instance.downcast_ref::<Arc<dyn Queue>>() {
                if let Err(e) = queue.shutdown(CLOSE_TIMEOUT).await {
                    self.logger.error(&format!("Error closing the connection {}: {}.", id, e));
                }
            }
        }

        self.report_info(METRICS_EVENT, &export_metrics(), Value::Null);
    }

    fn report_info(&self, kind: &str, message: &str, data: Value) {
        if kind != METRICS_EVENT {
            self.logger.info(message);
        }
        self.notify(StatusMessage::new(kind, message, data));
    }

    fn report_error(&self, message: &str, data: Value) {
        self.logger.error(message);
        self.notify(StatusMessage::new(ERROR_EVENT, message, data));
    }

    fn notify(&self, message: StatusMessage) {
        MetricsCollector::new().record_workgroup_event(&message.kind);
        self.notifier.notify(message);
    }
}

fn error_data(err: &SupervisorError) -> Value {
    json!({ "error": err.to_string() })
}
