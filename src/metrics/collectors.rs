//! Recording facade over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_CONSUMERS, BRIDGE_MESSAGES, CHECKPOINT_DECISIONS, JOBS_IN_PROGRESS, JOBS_TOTAL,
    JOB_DURATION, WORKGROUP_EVENTS,
};

/// Final disposition of one job delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed with attempts remaining; re-delivered later.
    Retried,
    /// Failed for good; moved to the dead-letter list.
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::Failed => "failed",
        }
    }
}

/// Metrics collector for kued operations.
///
/// ```ignore
/// use kued::metrics::{init_metrics, JobOutcome, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_job("orders", JobOutcome::Completed, elapsed);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome and handler duration of a job delivery.
    pub fn record_job(&self, topic: &str, outcome: JobOutcome, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[topic, outcome.as_str()])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[topic])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            topic = topic,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    /// Record a checkpoint pipeline decision (`skipped`, `processed`,
    /// `checkpointed` or `failed`).
    pub fn record_checkpoint(&self, topic: &str, decision: &str) {
        if let Some(decisions) = CHECKPOINT_DECISIONS.get() {
            decisions.with_label_values(&[topic, decision]).inc();
        }
    }

    /// Record one bridge forward.
    pub fn record_bridge_message(&self, bridge: &str, success: bool) {
        let status = if success { "forwarded" } else { "failed" };
        if let Some(messages) = BRIDGE_MESSAGES.get() {
            messages.with_label_values(&[bridge, status]).inc();
        }
    }

    /// Record a workgroup lifecycle event.
    pub fn record_workgroup_event(&self, event: &str) {
        if let Some(events) = WORKGROUP_EVENTS.get() {
            events.with_label_values(&[event]).inc();
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }

    pub fn consumer_started(&self) {
        if let Some(consumers) = ACTIVE_CONSUMERS.get() {
            consumers.inc();
        }
    }

    pub fn consumer_stopped(&self) {
        if let Some(consumers) = ACTIVE_CONSUMERS.get() {
            consumers.dec();
        }
    }
}
