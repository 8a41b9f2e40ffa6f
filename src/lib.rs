//! kued: workgroup orchestration for job-queue workers.
//!
//! This library wires named providers (queues, loggers, checkpoint stores)
//! into workers and bridges by configuration, gates job processing behind
//! persisted checkpoints, and launches workgroups as supervised child
//! processes.

// Core modules
pub mod bridge;
pub mod catalog;
pub mod checkpoint;
pub mod cli;
pub mod component;
pub mod config;
pub mod dependency;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod mq;
pub mod process;
pub mod providers;
pub mod queue;
pub mod task_manager;
pub mod worker;
pub mod workgroup;

// Re-export commonly used types
pub use catalog::ModuleCatalog;
pub use component::{Component, ComponentFactory};
pub use config::{Config, NodeConfig};
pub use dependency::DependencyManager;
pub use error::{CheckpointError, ComponentError, ConfigError, DependencyError, JobError};
pub use worker::Worker;
pub use workgroup::{Workgroup, WorkgroupManager};
