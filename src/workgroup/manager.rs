//! Cross-process side: launch one supervised child per workgroup and relay
//! their status messages.
//!
//! ```text
//! Disconnected --connect()--> Connecting --bus attached--> Connected
//!       ^                                                      |
//!       +---------------------- disconnect() ------------------+
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::supervisor::{ERROR_EVENT, RUN_COMMAND, WORKERS_SPAWNED_EVENT};
use crate::config::{Config, NodeConfig, WorkgroupConfig};
use crate::error::ConfigError;
use crate::metrics::MetricsCollector;
use crate::process::{
    BusEvent, LaunchDescriptor, ProcessError, ProcessInfo, ProcessManager, ProcessMessage,
    ProcessTarget, DEFAULT_MAX_MEMORY_RESTART, DEFAULT_RESTART_DELAY_MS,
};

/// Subcommand under which the child entry point runs.
pub const NODE_COMMAND: &str = "node";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Workgroup manager is not connected")]
    NotConnected,

    #[error("Failed to capture process ID for {0}")]
    ProcessIdMissing(String),

    #[error("Invalid launch descriptor for {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events relayed from workgroup children.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkgroupEvent {
    Error(ProcessMessage),
    WorkersSpawned(ProcessMessage),
    /// Any other status message type.
    Message(ProcessMessage),
    Disconnected,
}

impl WorkgroupEvent {
    fn from_message(message: ProcessMessage) -> Self {
        match message.data.kind.as_str() {
            ERROR_EVENT => Self::Error(message),
            WORKERS_SPAWNED_EVENT => Self::WorkersSpawned(message),
            _ => Self::Message(message),
        }
    }
}

/// A launched workgroup as tracked by the manager.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub process_id: u32,
    pub config: NodeConfig,
}

/// Process status decorated with the configuration it was launched from.
#[derive(Debug, Clone, Serialize)]
pub struct WorkgroupStatus {
    #[serde(flatten)]
    pub process: ProcessInfo,
    pub config: Option<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedWorkgroup {
    pub name: String,
    pub process_id: u32,
}

type Registry = Arc<Mutex<HashMap<String, RegistryEntry>>>;

/// Process name of a workgroup: its explicit name, else one derived from its
/// workers, else one derived from the current time.
pub fn workgroup_name(workgroup: &WorkgroupConfig) -> String {
    if let Some(name) = workgroup.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    if workgroup.workers.is_empty() {
        return format!("workgroup-{}", chrono::Utc::now().timestamp_millis());
    }
    format!("workgroup-{}", workgroup.workers.join(","))
}

/// Recursively merge `overlay` into `base`; objects merge, anything else
/// replaces.
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Launches workgroups through a [`ProcessManager`] and tracks them by name.
pub struct WorkgroupManager {
    processes: Arc<dyn ProcessManager>,
    script: PathBuf,
    state: Mutex<ManagerState>,
    registry: Registry,
    events: broadcast::Sender<WorkgroupEvent>,
    bus_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkgroupManager {
    /// Children run `script node run <encoded>`.
    pub fn new(processes: Arc<dyn ProcessManager>, script: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            processes,
            script: script.into(),
            state: Mutex::new(ManagerState::Disconnected),
            registry: Arc::new(Mutex::new(HashMap::new())),
            events,
            bus_task: Mutex::new(None),
        }
    }

    /// Children run the current executable.
    pub fn with_current_exe(processes: Arc<dyn ProcessManager>) -> Result<Self, ManagerError> {
        Ok(Self::new(processes, std::env::current_exe()?))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkgroupEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ManagerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ManagerState::Disconnected)
    }

    fn set_state(&self, state: ManagerState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn ensure_connected(&self) -> Result<(), ManagerError> {
        match self.state() {
            ManagerState::Connected => Ok(()),
            _ => Err(ManagerError::NotConnected),
        }
    }

    /// Snapshot of tracked workgroups: name to process id.
    pub fn tracked(&self) -> HashMap<String, u32> {
        self.registry
            .lock()
            .map(|registry| {
                registry
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.process_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Configuration a tracked workgroup was launched with.
    pub fn tracked_config(&self, name: &str) -> Option<NodeConfig> {
        self.registry
            .lock()
            .ok()
            .and_then(|registry| registry.get(name).map(|entry| entry.config.clone()))
    }

    /// Connect to the process manager and attach to its bus.
    pub async fn connect(&self) -> Result<(), ManagerError> {
        self.set_state(ManagerState::Connecting);

        let bus = match self.attach().await {
            Ok(bus) => bus,
            Err(e) => {
                self.set_state(ManagerState::Disconnected);
                return Err(e);
            }
        };

        let task = tokio::spawn(relay_bus(
            bus,
            self.events.clone(),
            Arc::clone(&self.registry),
        ));
        if let Ok(mut slot) = self.bus_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }

        self.set_state(ManagerState::Connected);
        info!("Process manager message bus online.");
        Ok(())
    }

    async fn attach(&self) -> Result<broadcast::Receiver<BusEvent>, ManagerError> {
        self.processes.connect().await?;
        Ok(self.processes.launch_bus().await?)
    }

    /// Validate `config` and start one process per workgroup, concurrently.
    ///
    /// Every workgroup is attempted; the first failure is returned and
    /// processes already started keep running.
    pub async fn launch(&self, config: &Config) -> Result<Vec<LaunchedWorkgroup>, ManagerError> {
        self.ensure_connected()?;
        config.validate()?;

        let results = join_all(
            config
                .workgroups
                .iter()
                .map(|workgroup| self.spawn_workgroup(config, workgroup)),
        )
        .await;

        let mut launched = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(workgroup) => launched.push(workgroup),
                Err(e) => {
                    error!(error = %e, "Failed to launch workgroup");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                error!("An error occurred launching one or more workers.");
                Err(e)
            }
            None => Ok(launched),
        }
    }

    /// Launch descriptor of one workgroup process.
    pub fn launch_descriptor(
        &self,
        name: &str,
        node: &NodeConfig,
    ) -> Result<LaunchDescriptor, ManagerError> {
        let encoded = node.encode()?;
        let mut descriptor = json!({
            "name": name,
            "script": self.script.to_string_lossy(),
            "exec_mode": "fork",
            "instances": node.workgroup.instances,
            "restart_delay": DEFAULT_RESTART_DELAY_MS,
            "max_memory_restart": DEFAULT_MAX_MEMORY_RESTART,
        });
        merge_values(&mut descriptor, &Value::Object(node.workgroup.overrides.clone()));

        if let Value::Object(fields) = &mut descriptor {
            fields.insert("name".to_string(), json!(name));
            fields.insert(
                "args".to_string(),
                json!([NODE_COMMAND, RUN_COMMAND, encoded]),
            );
        }

        serde_json::from_value(descriptor).map_err(|e| ManagerError::InvalidDescriptor {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    async fn spawn_workgroup(
        &self,
        config: &Config,
        workgroup: &WorkgroupConfig,
    ) -> Result<LaunchedWorkgroup, ManagerError> {
        let node = config.node_config(workgroup);
        let name = workgroup_name(workgroup);
        let descriptor = self.launch_descriptor(&name, &node)?;

        let apps = self.processes.start(descriptor).await?;
        let process_id = apps
            .iter()
            .find(|app| app.name == name)
            .map(|app| app.id)
            .ok_or_else(|| ManagerError::ProcessIdMissing(name.clone()))?;

        if let Ok(mut registry) = self.registry.lock() {
            registry.insert(
                name.clone(),
                RegistryEntry {
                    process_id,
                    config: node,
                },
            );
        }
        MetricsCollector::new().record_workgroup_event("launched");
        info!("WorkGroup Node {} started as process {}", name, process_id);

        Ok(LaunchedWorkgroup { name, process_id })
    }

    /// Start a stopped workgroup again.
    pub async fn resume(&self, target: &ProcessTarget) -> Result<(), ManagerError> {
        self.ensure_connected()?;
        self.processes.restart(target).await?;
        Ok(())
    }

    pub async fn stop(&self, target: &ProcessTarget) -> Result<(), ManagerError> {
        self.ensure_connected()?;
        self.processes.stop(target).await?;
        Ok(())
    }

    pub async fn restart(&self, target: &ProcessTarget) -> Result<(), ManagerError> {
        self.ensure_connected()?;
        self.processes.restart(target).await?;
        Ok(())
    }

    /// Delete the process and forget the workgroup.
    pub async fn kill(&self, target: &ProcessTarget) -> Result<(), ManagerError> {
        self.ensure_connected()?;
        let deleted = self.processes.delete(target).await?;
        for info in &deleted {
            evict(&self.registry, &info.name, info.id);
        }
        Ok(())
    }

    pub async fn rotate_logs(&self) -> Result<(), ManagerError> {
        self.ensure_connected()?;
        self.processes.reload_logs().await?;
        Ok(())
    }

    pub async fn get_workgroup(
        &self,
        target: &ProcessTarget,
    ) -> Result<Vec<WorkgroupStatus>, ManagerError> {
        self.ensure_connected()?;
        let processes = self.processes.describe(target).await?;
        Ok(self.decorate(processes))
    }

    /// Every managed process; tracked workgroups the process manager no
    /// longer lists are forgotten.
    pub async fn get_workgroups(&self) -> Result<Vec<WorkgroupStatus>, ManagerError> {
        self.ensure_connected()?;
        let processes = self.processes.list().await?;

        if let Ok(mut registry) = self.registry.lock() {
            registry.retain(|name, entry| {
                let alive = processes
                    .iter()
                    .any(|p| p.name == *name && p.id == entry.process_id);
                if !alive {
                    debug!(workgroup = %name, "Forgetting workgroup no longer managed");
                }
                alive
            });
        }
        Ok(self.decorate(processes))
    }

    fn decorate(&self, processes: Vec<ProcessInfo>) -> Vec<WorkgroupStatus> {
        let registry = self.registry.lock().ok();
        processes
            .into_iter()
            .map(|process| {
                let config = registry
                    .as_ref()
                    .and_then(|r| r.get(&process.name))
                    .map(|entry| entry.config.clone());
                WorkgroupStatus { process, config }
            })
            .collect()
    }

    /// Detach from the bus and drop the process manager link.
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        if let Ok(mut slot) = self.bus_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        let result = self.processes.disconnect().await;
        self.set_state(ManagerState::Disconnected);
        let _ = self.events.send(WorkgroupEvent::Disconnected);
        result.map_err(ManagerError::from)
    }
}

impl Drop for WorkgroupManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.bus_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

fn evict(registry: &Registry, name: &str, process_id: u32) {
    if let Ok(mut registry) = registry.lock() {
        if registry
            .get(name)
            .is_some_and(|entry| entry.process_id == process_id)
        {
            registry.remove(name);
        }
    }
}

async fn relay_bus(
    mut bus: broadcast::Receiver<BusEvent>,
    events: broadcast::Sender<WorkgroupEvent>,
    registry: Registry,
) {
    loop {
        match bus.recv().await {
            Ok(BusEvent::Message(message)) => {
                MetricsCollector::new().record_workgroup_event(&message.data.kind);
                let _ = events.send(WorkgroupEvent::from_message(message));
            }
            Ok(BusEvent::Deleted(process)) => evict(&registry, &process.name, process.id),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Dropped process bus messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ProviderConfig, WorkerConfig};
    use crate::process::{ProcessRef, ProcessStatus};
    use crate::workgroup::notifier::StatusMessage;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct StubState {
        connected: bool,
        started: Vec<LaunchDescriptor>,
        processes: Vec<ProcessInfo>,
        calls: Vec<String>,
        fail_names: Vec<String>,
    }

    struct StubProcessManager {
        state: Mutex<StubState>,
        bus: broadcast::Sender<BusEvent>,
    }

    impl StubProcessManager {
        fn new() -> Self {
            Self {
                state: Mutex::new(StubState::default()),
                bus: broadcast::channel(16).0,
            }
        }

        fn failing(names: &[&str]) -> Self {
            let stub = Self::new();
            stub.state.lock().expect("lock").fail_names =
                names.iter().map(|n| n.to_string()).collect();
            stub
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().expect("lock").calls.clone()
        }

        fn started(&self) -> Vec<LaunchDescriptor> {
            self.state.lock().expect("lock").started.clone()
        }

        fn forget(&self, name: &str) {
            self.state
                .lock()
                .expect("lock")
                .processes
                .retain(|p| p.name != name);
        }

        fn matching(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
            let found: Vec<ProcessInfo> = self
                .state
                .lock()
                .expect("lock")
                .processes
                .iter()
                .filter(|p| target.matches(p))
                .cloned()
                .collect();
            if found.is_empty() {
                Err(ProcessError::NotFound(target.to_string()))
            } else {
                Ok(found)
            }
        }

        fn record(&self, call: String) {
            self.state.lock().expect("lock").calls.push(call);
        }
    }

    #[async_trait]
    impl ProcessManager for StubProcessManager {
        async fn connect(&self) -> Result<(), ProcessError> {
            self.state.lock().expect("lock").connected = true;
            Ok(())
        }

        async fn launch_bus(&self) -> Result<broadcast::Receiver<BusEvent>, ProcessError> {
            Ok(self.bus.subscribe())
        }

        async fn start(
            &self,
            descriptor: LaunchDescriptor,
        ) -> Result<Vec<ProcessInfo>, ProcessError> {
            let mut state = self.state.lock().expect("lock");
            if state.fail_names.contains(&descriptor.name) {
                return Err(ProcessError::Spawn(descriptor.name));
            }
            let info = ProcessInfo {
                id: state.processes.len() as u32,
                name: descriptor.name.clone(),
                pid: Some(1000 + state.processes.len() as u32),
                status: ProcessStatus::Online,
                restarts: 0,
                memory: None,
                started_at: None,
            };
            state.processes.push(info.clone());
            state.started.push(descriptor);
            Ok(vec![info])
        }

        async fn stop(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
            self.record(format!("stop {}", target));
            self.matching(target)
        }

        async fn restart(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
            self.record(format!("restart {}", target));
            self.matching(target)
        }

        async fn delete(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
            self.record(format!("delete {}", target));
            let deleted = self.matching(target)?;
            self.state
                .lock()
                .expect("lock")
                .processes
                .retain(|p| !target.matches(p));
            Ok(deleted)
        }

        async fn describe(
            &self,
            target: &ProcessTarget,
        ) -> Result<Vec<ProcessInfo>, ProcessError> {
            self.matching(target)
        }

        async fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
            Ok(self.state.lock().expect("lock").processes.clone())
        }

        async fn reload_logs(&self) -> Result<(), ProcessError> {
            self.record("reload_logs".to_string());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ProcessError> {
            self.state.lock().expect("lock").connected = false;
            Ok(())
        }
    }

    fn config() -> Config {
        let mut named = WorkgroupConfig::new(vec!["dumper".to_string()]).with_name("dumpers");
        named
            .overrides
            .insert("max_memory_restart".to_string(), json!("1G"));
        named
            .overrides
            .insert("env".to_string(), json!({ "RUST_LOG": "debug" }));

        Config {
            providers: vec![ProviderConfig::module("kue", "kued/providers/memory-queue")],
            workers: vec![WorkerConfig::new("dumper", "kued/workers/dumper")],
            bridges: vec![BridgeConfig::new("relay", "kue:a", "kue:b")],
            workgroups: vec![
                named,
                WorkgroupConfig::new(vec!["dumper".to_string(), "relay".to_string()])
                    .with_instances(2),
            ],
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<WorkgroupEvent>) -> WorkgroupEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event in time")
            .expect("event")
    }

    async fn connected(stub: Arc<StubProcessManager>) -> WorkgroupManager {
        let manager = WorkgroupManager::new(stub, "/usr/local/bin/kued");
        manager.connect().await.expect("connect");
        manager
    }

    #[test]
    fn test_workgroup_names() {
        let named = WorkgroupConfig::new(vec!["a".to_string()]).with_name("billing");
        assert_eq!(workgroup_name(&named), "billing");

        let derived = WorkgroupConfig::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(workgroup_name(&derived), "workgroup-a,b");

        let empty = WorkgroupConfig::new(Vec::new());
        assert!(workgroup_name(&empty).starts_with("workgroup-"));
    }

    #[test]
    fn test_merge_is_deep() {
        let mut base = json!({ "a": 1, "env": { "X": "1" } });
        merge_values(&mut base, &json!({ "a": 2, "env": { "Y": "2" } }));
        assert_eq!(base, json!({ "a": 2, "env": { "X": "1", "Y": "2" } }));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let manager = WorkgroupManager::new(Arc::new(StubProcessManager::new()), "kued");
        assert_eq!(manager.state(), ManagerState::Disconnected);
        assert!(matches!(
            manager.launch(&config()).await,
            Err(ManagerError::NotConnected)
        ));
        assert!(matches!(
            manager.stop(&"dumpers".into()).await,
            Err(ManagerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_launch_spawns_every_workgroup() {
        let stub = Arc::new(StubProcessManager::new());
        let manager = connected(stub.clone()).await;
        assert_eq!(manager.state(), ManagerState::Connected);

        let launched = manager.launch(&config()).await.expect("launch");
        assert_eq!(launched.len(), 2);

        let tracked = manager.tracked();
        assert!(tracked.contains_key("dumpers"));
        assert!(tracked.contains_key("workgroup-dumper,relay"));

        let started = stub.started();
        let dumpers = started
            .iter()
            .find(|d| d.name == "dumpers")
            .expect("dumpers descriptor");
        assert_eq!(dumpers.script, "/usr/local/bin/kued");
        assert_eq!(dumpers.exec_mode, "fork");
        assert_eq!(dumpers.restart_delay, DEFAULT_RESTART_DELAY_MS);
        assert_eq!(dumpers.max_memory_restart.as_deref(), Some("1G"));
        assert_eq!(dumpers.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(dumpers.args[..2], ["node".to_string(), "run".to_string()]);

        let shipped = NodeConfig::decode(&dumpers.args[2]).expect("decode");
        assert_eq!(shipped.workgroup.name.as_deref(), Some("dumpers"));
        assert_eq!(shipped.workers.len(), 1);

        let pair = started
            .iter()
            .find(|d| d.name == "workgroup-dumper,relay")
            .expect("derived descriptor");
        assert_eq!(pair.instances, 2);
        assert_eq!(pair.max_memory_restart.as_deref(), Some(DEFAULT_MAX_MEMORY_RESTART));
    }

    #[tokio::test]
    async fn test_one_failed_spawn_does_not_stop_the_others() {
        let stub = Arc::new(StubProcessManager::failing(&["dumpers"]));
        let manager = connected(stub.clone()).await;

        let err = manager.launch(&config()).await.expect_err("launch fails");
        assert!(matches!(err, ManagerError::Process(ProcessError::Spawn(_))));

        let tracked = manager.tracked();
        assert_eq!(tracked.len(), 1);
        assert!(tracked.contains_key("workgroup-dumper,relay"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let manager = connected(Arc::new(StubProcessManager::new())).await;
        let mut config = config();
        config.workgroups.push(WorkgroupConfig::new(Vec::new()));

        assert!(matches!(
            manager.launch(&config).await,
            Err(ManagerError::Config(ConfigError::Invalid(_)))
        ));
        assert!(manager.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_operations_delegate() {
        let stub = Arc::new(StubProcessManager::new());
        let manager = connected(stub.clone()).await;
        manager.launch(&config()).await.expect("launch");

        manager.stop(&"dumpers".into()).await.expect("stop");
        manager.resume(&"dumpers".into()).await.expect("resume");
        manager.restart(&"0".into()).await.expect("restart");
        manager.rotate_logs().await.expect("rotate");
        manager.kill(&"dumpers".into()).await.expect("kill");

        assert_eq!(
            stub.calls(),
            vec![
                "stop dumpers",
                "restart dumpers",
                "restart 0",
                "reload_logs",
                "delete dumpers"
            ]
        );
        assert!(!manager.tracked().contains_key("dumpers"));
        assert!(matches!(
            manager.stop(&"dumpers".into()).await,
            Err(ManagerError::Process(ProcessError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_status_listing_is_decorated_and_reconciled() {
        let stub = Arc::new(StubProcessManager::new());
        let manager = connected(stub.clone()).await;
        manager.launch(&config()).await.expect("launch");

        let one = manager.get_workgroup(&"dumpers".into()).await.expect("describe");
        assert_eq!(one.len(), 1);
        let config = one[0].config.as_ref().expect("config");
        assert_eq!(config.workgroup.name.as_deref(), Some("dumpers"));

        stub.forget("dumpers");
        let all = manager.get_workgroups().await.expect("list");
        assert_eq!(all.len(), 1);
        assert!(all[0].config.is_some());
        assert!(!manager.tracked().contains_key("dumpers"));
        assert!(manager.tracked_config("workgroup-dumper,relay").is_some());
    }

    #[tokio::test]
    async fn test_bus_messages_become_typed_events() {
        let stub = Arc::new(StubProcessManager::new());
        let manager = connected(stub.clone()).await;
        manager.launch(&config()).await.expect("launch");
        let mut events = manager.subscribe();

        let process = ProcessRef {
            id: manager.tracked()["dumpers"],
            name: "dumpers".to_string(),
        };
        for kind in ["workers-spawned", "error", "metrics"] {
            stub.bus
                .send(BusEvent::Message(ProcessMessage {
                    process: process.clone(),
                    data: StatusMessage::new(kind, "text", Value::Null),
                }))
                .expect("send");
        }
        stub.bus
            .send(BusEvent::Deleted(process.clone()))
            .expect("send");

        assert!(matches!(
            next_event(&mut events).await,
            WorkgroupEvent::WorkersSpawned(_)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            WorkgroupEvent::Error(ref m) if m.process.name == "dumpers"
        ));
        assert!(matches!(
            next_event(&mut events).await,
            WorkgroupEvent::Message(ref m) if m.data.kind == "metrics"
        ));

        tokio::time::timeout(Duration::from_secs(1), async {
            while manager.tracked().contains_key("dumpers") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("evicted on delete");

        manager.disconnect().await.expect("disconnect");
        assert_eq!(manager.state(), ManagerState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            WorkgroupEvent::Disconnected
        ));
    }
}
