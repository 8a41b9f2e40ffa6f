//! Prometheus metrics for job processing, checkpoints, bridges and
//! workgroups.
//!
//! # Example
//!
//! ```ignore
//! use kued::metrics::{export_metrics, init_metrics, JobOutcome, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_job("orders", JobOutcome::Completed, elapsed);
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_CONSUMERS, BRIDGE_MESSAGES, CHECKPOINT_DECISIONS, JOBS_IN_PROGRESS, JOBS_TOTAL,
    JOB_DURATION, REGISTRY, WORKGROUP_EVENTS,
};
