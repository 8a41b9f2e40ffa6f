//! Job definitions.
//!
//! - `Job`: one unit of work on a topic, with its retry bookkeeping
//! - `Backoff`: delay policy between attempts
//! - `JobBuilder`: chainable job options ending in `save()`

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Queue, QueueError};

/// Default number of attempts for a job (no retries).
const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Default priority for jobs (0 is normal priority).
const DEFAULT_PRIORITY: i32 = 0;

/// Delay policy between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        #[serde(default)]
        delay: u64,
    },
    /// Delay doubles with each attempt.
    Exponential {
        /// Base delay in milliseconds.
        #[serde(default)]
        delay: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed { delay: 0 }
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay: delay.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            delay: base.as_millis() as u64,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => Duration::from_millis(delay),
            Self::Exponential { delay } => {
                let exponent = attempt.saturating_sub(1).min(20);
                Duration::from_millis(delay.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// A unit of work delivered to the handler registered for its topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub topic: String,
    /// Caller payload.
    pub data: Value,
    /// Jobs with priority above zero jump the pending line.
    #[serde(default)]
    pub priority: i32,
    /// Attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Bound on a single handler invocation, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Delay before first delivery, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Error of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Job {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            data,
            priority: DEFAULT_PRIORITY,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            ttl: None,
            delay: None,
            created_at: Utc::now(),
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the total number of attempts; values below one are raised to one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay.as_millis() as u64);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    /// Initial delivery delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.delay.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    /// Increments the attempt counter. Called before each delivery.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Whether a failed job gets another delivery.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Delay before the next delivery of a failed job.
    pub fn retry_delay(&self) -> Duration {
        self.backoff.delay_for(self.attempts.max(1))
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Chainable options for a job about to be saved to a queue.
///
/// Obtained from [`dyn Queue::create`](super::Queue).
#[must_use = "a job is only queued once `save` is awaited"]
pub struct JobBuilder<'a> {
    queue: &'a dyn Queue,
    job: Job,
}

impl<'a> JobBuilder<'a> {
    pub(crate) fn new(queue: &'a dyn Queue, job: Job) -> Self {
        Self { queue, job }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.job = self.job.with_max_attempts(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.job.backoff = backoff;
        self
    }

    /// A zero ttl leaves the handler unbounded.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.job = self.job.with_ttl(ttl);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.job = self.job.with_delay(delay);
        self
    }

    /// The job as it would be saved.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Hand the job to the queue.
    pub async fn save(self) -> Result<Uuid, QueueError> {
        self.queue.enqueue(self.job).await
    }
}
