//! Status messages from a workgroup child to its parent.
//!
//! A supervised child writes one JSON line per message on stdout:
//!
//! ```text
//! {"type":"process:msg","data":{"type":"workers-spawned","message":"...","data":{...},"timestamp":"..."}}
//! ```
//!
//! The process manager reads these lines back and republishes them on its
//! bus. Outside supervision the [`NullNotifier`] drops everything.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Packet type of a child status line.
pub const PROCESS_MESSAGE: &str = "process:msg";

/// Set to `1` in the environment of supervised children.
pub const SUPERVISED_ENV: &str = "KUED_SUPERVISED";

/// One status message (`error`, `workers-spawned`, `metrics`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StatusMessage {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Envelope written on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPacket {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: StatusMessage,
}

impl StatusPacket {
    pub fn new(data: StatusMessage) -> Self {
        Self {
            kind: PROCESS_MESSAGE.to_string(),
            data,
        }
    }

    /// Parse a child stdout line; `None` for anything that is not a status
    /// packet.
    pub fn parse(line: &str) -> Option<Self> {
        let packet: Self = serde_json::from_str(line.trim()).ok()?;
        (packet.kind == PROCESS_MESSAGE).then_some(packet)
    }
}

/// Channel from a workgroup to whoever launched it.
pub trait ParentNotifier: Send + Sync {
    fn notify(&self, message: StatusMessage);
}

/// Writes status packets to stdout.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

impl ParentNotifier for StdoutNotifier {
    fn notify(&self, message: StatusMessage) {
        let line = match serde_json::to_string(&StatusPacket::new(message)) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Could not serialize status message");
                return;
            }
        };

        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
            tracing::error!(error = %e, "Could not notify parent process");
        }
    }
}

/// Discards status messages.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl ParentNotifier for NullNotifier {
    fn notify(&self, message: StatusMessage) {
        tracing::trace!(kind = %message.kind, "No parent to notify");
    }
}

/// [`StdoutNotifier`] when [`SUPERVISED_ENV`] is `1`, else [`NullNotifier`].
pub fn notifier_from_env() -> Arc<dyn ParentNotifier> {
    match std::env::var(SUPERVISED_ENV) {
        Ok(value) if value == "1" => Arc::new(StdoutNotifier),
        _ => Arc::new(NullNotifier),
    }
}
