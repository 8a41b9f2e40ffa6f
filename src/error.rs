//! Error types shared across kued subsystems.
//!
//! Defines the error types that cross module boundaries:
//! - Dependency resolution and provider construction
//! - Configuration loading, validation and transport
//! - Checkpoint store access
//! - Job and message handling outcomes
//! - Component (worker / bridge) construction

use thiserror::Error;

/// Errors raised by the dependency manager while resolving providers.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("Dependency request does not conform to the dependency shape: {0}")]
    InvalidRequest(String),

    #[error("Could not find target provider: {0}")]
    MissingProvider(String),

    #[error("Provider '{id}' does not conform to the provider shape: {reason}")]
    InvalidProvider { id: String, reason: String },

    #[error("Could not load provider module '{module}' for {id}")]
    ModuleNotFound { module: String, id: String },

    #[error("Unknown provider mode '{mode}' for {id}; expected factory|class|static")]
    UnknownMode { mode: String, id: String },

    #[error("Provider factory yielded nothing for {0}")]
    EmptyInstance(String),

    #[error("Provider {id} is not a {expected}")]
    TypeMismatch { id: String, expected: &'static str },

    #[error("Provider {id} failed to construct: {reason}")]
    Construction { id: String, reason: String },

    #[error("Provider {0} requires the dependency manager but none was injected")]
    ManagerUnavailable(String),
}

/// Errors that can occur while loading or transporting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("Workgroup not found in config: {0}")]
    WorkgroupNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Errors reported by checkpoint stores.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure outcome of a single job or message delivery.
///
/// Any `Err(JobError)` returned from a handler fails the job and hands it
/// back to the queue's retry policy.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Handler(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Checkpoint value for key '{0}' was absent.")]
    CheckpointAbsent(String),

    #[error("Job failed to complete due to unhandled panic: {0}")]
    Panicked(String),

    #[error("Job exceeded its ttl of {0:?}")]
    Timeout(std::time::Duration),

    #[error("No message handler was set for '{0}'")]
    NoMessageHandler(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

impl JobError {
    /// Convenience constructor for handler-level failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Errors raised while constructing workers and bridges.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("Could not instantiate module: {0}")]
    ModuleNotFound(String),

    #[error("Invalid options for '{component}': {reason}")]
    InvalidOptions { component: String, reason: String },

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] crate::bridge::BridgeError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Initialization of '{component}' failed: {reason}")]
    Init { component: String, reason: String },
}
