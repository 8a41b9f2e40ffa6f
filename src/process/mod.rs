//! Process manager interface used by the workgroup manager.
//!
//! The workgroup manager only talks to a [`ProcessManager`]; the
//! [`LocalProcessManager`] implementation supervises children of the current
//! process with `tokio::process`.

pub mod local;

pub use local::LocalProcessManager;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::workgroup::notifier::StatusMessage;

/// Default delay before an exited child is restarted.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;

/// Default resident memory above which a child is restarted.
pub const DEFAULT_MAX_MEMORY_RESTART: &str = "512M";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Not connected to the process manager")]
    NotConnected,

    #[error("Process or name not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Invalid launch descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Process manager request failed: {0}")]
    Rpc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A process id or a process name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessTarget {
    Id(u32),
    Name(String),
}

impl ProcessTarget {
    pub fn matches(&self, info: &ProcessInfo) -> bool {
        match self {
            Self::Id(id) => info.id == *id,
            Self::Name(name) => info.name == *name,
        }
    }
}

impl FromStr for ProcessTarget {
    type Err = std::convert::Infallible;

    /// Numeric strings are ids; anything else is a name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<u32>()
            .map(Self::Id)
            .unwrap_or_else(|_| Self::Name(s.to_string())))
    }
}

impl From<&str> for ProcessTarget {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|never| match never {})
    }
}

impl From<u32> for ProcessTarget {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Launching,
    Online,
    Stopping,
    Stopped,
    Errored,
}

/// Status of one managed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: u32,
    pub name: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub restarts: u32,
    /// Resident memory in bytes, when known.
    pub memory: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
}

/// How to start a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_exec_mode")]
    pub exec_mode: String,
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Milliseconds.
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_restart: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Keys this manager does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_exec_mode() -> String {
    "fork".to_string()
}

fn default_instances() -> u32 {
    1
}

fn default_restart_delay() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

impl LaunchDescriptor {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            exec_mode: default_exec_mode(),
            instances: default_instances(),
            restart_delay: default_restart_delay(),
            max_memory_restart: None,
            env: HashMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.name.trim().is_empty() {
            return Err(ProcessError::InvalidDescriptor("empty name".to_string()));
        }
        if self.script.trim().is_empty() {
            return Err(ProcessError::InvalidDescriptor("empty script".to_string()));
        }
        if self.exec_mode != "fork" {
            return Err(ProcessError::InvalidDescriptor(format!(
                "unsupported exec_mode '{}'",
                self.exec_mode
            )));
        }
        if self.instances < 1 {
            return Err(ProcessError::InvalidDescriptor(
                "instances must be >= 1".to_string(),
            ));
        }
        if let Some(limit) = &self.max_memory_restart {
            parse_memory_limit(limit).ok_or_else(|| {
                ProcessError::InvalidDescriptor(format!("bad max_memory_restart '{}'", limit))
            })?;
        }
        Ok(())
    }

    /// `max_memory_restart` in bytes.
    pub fn memory_limit(&self) -> Option<u64> {
        self.max_memory_restart.as_deref().and_then(parse_memory_limit)
    }
}

/// Parse `512M`, `1G`, `200K` or a plain byte count.
pub fn parse_memory_limit(limit: &str) -> Option<u64> {
    let limit = limit.trim();
    let (digits, multiplier) = match limit.chars().last()?.to_ascii_uppercase() {
        'K' => (&limit[..limit.len() - 1], 1024),
        'M' => (&limit[..limit.len() - 1], 1024 * 1024),
        'G' => (&limit[..limit.len() - 1], 1024 * 1024 * 1024),
        _ => (limit, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// Process identity attached to bus events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub id: u32,
    pub name: String,
}

/// A status message received from a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub process: ProcessRef,
    pub data: StatusMessage,
}

/// Events published on the process manager bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// `process:msg`
    Message(ProcessMessage),
    /// `process:deleted`
    Deleted(ProcessRef),
}

/// Supervisor of OS processes.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn connect(&self) -> Result<(), ProcessError>;

    /// Subscribe to child status messages and process lifecycle events.
    async fn launch_bus(&self) -> Result<broadcast::Receiver<BusEvent>, ProcessError>;

    /// Start `descriptor.instances` processes named `descriptor.name`.
    async fn start(&self, descriptor: LaunchDescriptor) -> Result<Vec<ProcessInfo>, ProcessError>;

    async fn stop(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError>;

    /// Restart running processes and start stopped ones.
    async fn restart(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError>;

    async fn delete(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError>;

    async fn describe(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError>;

    async fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError>;

    async fn reload_logs(&self) -> Result<(), ProcessError>;

    async fn disconnect(&self) -> Result<(), ProcessError>;
}
