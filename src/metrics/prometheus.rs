//! Prometheus metrics registration and export.
//!
//! Defines every Prometheus metric kued records and the functions that
//! initialize and export them.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all kued metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total jobs handled, labeled by topic and outcome
/// (`completed`, `retried`, `failed`).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler duration in seconds, labeled by topic.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs currently inside a handler.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Checkpoint pipeline outcomes, labeled by topic and decision
/// (`skipped`, `processed`, `checkpointed`, `failed`).
pub static CHECKPOINT_DECISIONS: OnceLock<CounterVec> = OnceLock::new();

/// Bridge forwards, labeled by bridge name and status.
pub static BRIDGE_MESSAGES: OnceLock<CounterVec> = OnceLock::new();

/// Workgroup lifecycle events, labeled by event type.
pub static WORKGROUP_EVENTS: OnceLock<CounterVec> = OnceLock::new();

/// Number of running queue consumer loops.
pub static ACTIVE_CONSUMERS: OnceLock<IntGauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the first set of metrics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("kued_jobs_total", "Total number of jobs handled"),
        &["topic", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("kued_job_duration_seconds", "Job handler duration in seconds")
            .buckets(vec![0.005, 0.05, 0.25, 1.0, 5.0, 30.0, 120.0]),
        &["topic"],
    )?;

    let jobs_in_progress = Gauge::new(
        "kued_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let checkpoint_decisions = CounterVec::new(
        Opts::new(
            "kued_checkpoint_decisions_total",
            "Checkpoint pipeline outcomes",
        ),
        &["topic", "decision"],
    )?;

    let bridge_messages = CounterVec::new(
        Opts::new("kued_bridge_messages_total", "Messages relayed by bridges"),
        &["bridge", "status"],
    )?;

    let workgroup_events = CounterVec::new(
        Opts::new("kued_workgroup_events_total", "Workgroup lifecycle events"),
        &["event"],
    )?;

    let active_consumers = IntGauge::new(
        "kued_active_consumers",
        "Number of running queue consumer loops",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(checkpoint_decisions.clone()))?;
    registry.register(Box::new(bridge_messages.clone()))?;
    registry.register(Box::new(workgroup_events.clone()))?;
    registry.register(Box::new(active_consumers.clone()))?;

    // Losing a race with another initializer leaves its metrics in place.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = CHECKPOINT_DECISIONS.set(checkpoint_decisions);
    let _ = BRIDGE_MESSAGES.set(bridge_messages);
    let _ = WORKGROUP_EVENTS.set(workgroup_events);
    let _ = ACTIVE_CONSUMERS.set(active_consumers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry is not
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
