//! Redis-backed job queue with reliable dequeue.
//!
//! # Key layout
//!
//! For each topic, under the configured prefix:
//!
//! - `{prefix}:jobs:{topic}`: pending jobs (LPUSH in, RPOPLPUSH out)
//! - `{prefix}:jobs:{topic}:active`: jobs inside a handler (crash recovery)
//! - `{prefix}:jobs:{topic}:delayed`: sorted set scored by ready time in ms
//! - `{prefix}:jobs:{topic}:failed`: jobs that exhausted their attempts
//!
//! Jobs move atomically from pending to active when dequeued. When
//! `recover_on_start` is set, jobs left in the active list by a crashed
//! process are requeued the first time a topic is processed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    consumer_name, deliver, Consumers, Job, JobHandler, Queue, QueueError, Settlement,
};

/// Options of the `kued/providers/redis-queue` provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisQueueOptions {
    pub url: String,
    pub prefix: String,
    /// How long an idle consumer waits before polling again.
    pub poll_interval_ms: u64,
    pub recover_on_start: bool,
}

impl Default for RedisQueueOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "kue".to_string(),
            poll_interval_ms: 1000,
            recover_on_start: false,
        }
    }
}

impl RedisQueueOptions {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Redis keys of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicKeys {
    pub pending: String,
    pub active: String,
    pub delayed: String,
    pub failed: String,
}

impl TopicKeys {
    pub fn new(prefix: &str, topic: &str) -> Self {
        let pending = format!("{}:jobs:{}", prefix, topic);
        Self {
            active: format!("{}:active", pending),
            delayed: format!("{}:delayed", pending),
            failed: format!("{}:failed", pending),
            pending,
        }
    }
}

struct Inner {
    options: RedisQueueOptions,
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
}

impl Inner {
    /// Shared connection, opened on first use.
    async fn connection(&self) -> Result<ConnectionManager, QueueError> {
        self.connection
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
            })
            .await
            .cloned()
    }

    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let keys = TopicKeys::new(&self.options.prefix, &job.topic);
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.connection().await?;

        if let Some(delay) = job.delay() {
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            conn.zadd::<_, _, _, ()>(&keys.delayed, serialized, ready_at)
                .await?;
        } else if job.priority > 0 {
            // The consuming end of the list.
            conn.rpush::<_, _, ()>(&keys.pending, serialized).await?;
        } else {
            conn.lpush::<_, _, ()>(&keys.pending, serialized).await?;
        }

        Ok(())
    }

    /// Move delayed jobs whose ready time has passed onto the pending list.
    async fn promote_delayed(&self, keys: &TopicKeys) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = conn.zrangebyscore(&keys.delayed, "-inf", now).await?;
        let mut promoted = 0;

        for job_data in due {
            // Only the consumer that removes the entry pushes it.
            let removed: usize = conn.zrem(&keys.delayed, &job_data).await?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(&keys.pending, &job_data).await?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Atomically move the next pending job to the active list.
    async fn dequeue(&self, keys: &TopicKeys) -> Result<Option<(Job, String)>, QueueError> {
        let mut conn = self.connection().await?;

        let result: Option<String> = conn.rpoplpush(&keys.pending, &keys.active).await?;

        let Some(data) = result else {
            return Ok(None);
        };

        match serde_json::from_str::<Job>(&data) {
            Ok(job) => Ok(Some((job, data))),
            Err(e) => {
                warn!(key = %keys.pending, error = %e, "Discarding malformed job");
                let entry = serde_json::json!({
                    "raw": data,
                    "error": e.to_string(),
                    "moved_at": Utc::now().to_rfc3339(),
                });
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .lrem(&keys.active, 1, &data)
                    .lpush(&keys.failed, serde_json::to_string(&entry)?);
                pipe.query_async::<_, ()>(&mut conn).await?;
                Ok(None)
            }
        }
    }

    /// Apply the outcome of a delivery to the job's Redis entries.
    async fn settle(
        &self,
        keys: &TopicKeys,
        raw: &str,
        job: &Job,
        settlement: Settlement,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&keys.active, 1, raw);

        match settlement {
            Settlement::Completed => {}
            Settlement::Retry(delay) => {
                let serialized = serde_json::to_string(job)?;
                if delay.is_zero() {
                    // Front of the line for immediate retry.
                    pipe.rpush(&keys.pending, serialized);
                } else {
                    let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                    pipe.zadd(&keys.delayed, serialized, ready_at);
                }
            }
            Settlement::Failed => {
                let entry = serde_json::json!({
                    "job": job,
                    "error": job.error,
                    "moved_at": Utc::now().to_rfc3339(),
                });
                pipe.lpush(&keys.failed, serde_json::to_string(&entry)?);
            }
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Requeue jobs stranded in the active list.
    async fn recover_active_jobs(&self, keys: &TopicKeys) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let jobs: Vec<String> = conn.lrange(&keys.active, 0, -1).await?;
        let mut recovered = 0;

        for job_data in jobs {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&keys.active, 1, &job_data)
                .rpush(&keys.pending, &job_data);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        Ok(recovered)
    }
}

/// Job queue stored in Redis.
pub struct RedisQueue {
    inner: Arc<Inner>,
    consumers: Consumers,
    /// Handlers registered per topic.
    registrations: Mutex<HashMap<String, usize>>,
}

impl RedisQueue {
    /// Creates a queue without connecting; the connection opens on first use.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the URL is invalid.
    pub fn new(options: RedisQueueOptions) -> Result<Self, QueueError> {
        let client = redis::Client::open(options.url.as_str())
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                client,
                connection: OnceCell::new(),
            }),
            consumers: Consumers::new(),
            registrations: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a queue and opens its connection immediately.
    pub async fn connect(options: RedisQueueOptions) -> Result<Self, QueueError> {
        let queue = Self::new(options)?;
        queue.inner.connection().await?;
        Ok(queue)
    }

    pub fn options(&self) -> &RedisQueueOptions {
        &self.inner.options
    }

    /// Count a new handler for `topic`, returning how many came before it.
    fn register(&self, topic: &str) -> usize {
        match self.registrations.lock() {
            Ok(mut registrations) => {
                let count = registrations.entry(topic.to_string()).or_insert(0);
                *count += 1;
                *count - 1
            }
            Err(_) => 0,
        }
    }

    pub fn keys(&self, topic: &str) -> TopicKeys {
        TopicKeys::new(&self.inner.options.prefix, topic)
    }

    pub async fn pending_len(&self, topic: &str) -> Result<usize, QueueError> {
        let mut conn = self.inner.connection().await?;
        Ok(conn.llen(self.keys(topic).pending).await?)
    }

    pub async fn failed_len(&self, topic: &str) -> Result<usize, QueueError> {
        let mut conn = self.inner.connection().await?;
        Ok(conn.llen(self.keys(topic).failed).await?)
    }
}

async fn consume(
    consumer: String,
    inner: Arc<Inner>,
    keys: TopicKeys,
    handler: JobHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let poll_interval = inner.options.poll_interval();
    info!(consumer = %consumer, key = %keys.pending, "Consumer started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                info!(consumer = %consumer, "Consumer received shutdown signal");
                break;
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(broadcast::error::TryRecvError::Empty) => {}
        }

        if let Err(e) = inner.promote_delayed(&keys).await {
            warn!(consumer = %consumer, error = %e, "Failed to promote delayed jobs");
        }

        match inner.dequeue(&keys).await {
            Ok(Some((mut job, raw))) => {
                let settlement = deliver(&handler, &mut job, &consumer).await;
                if let Err(e) = inner.settle(&keys, &raw, &job, settlement).await {
                    error!(
                        consumer = %consumer,
                        job_id = %job.id,
                        error = %e,
                        "Failed to record job outcome"
                    );
                }
            }
            Ok(None) => {
                debug!(consumer = %consumer, "No jobs available");
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                error!(consumer = %consumer, error = %e, "Failed to dequeue job");
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    info!(consumer = %consumer, "Consumer stopped");
}

#[async_trait]
impl Queue for RedisQueue {
    async fn process(
        &self,
        topic: &str,
        concurrency: usize,
        handler: JobHandler,
    ) -> Result<(), QueueError> {
        if self.consumers.is_closed() {
            return Err(QueueError::ShutDown);
        }

        let registration = self.register(topic);
        let keys = self.keys(topic);

        if registration == 0 && self.inner.options.recover_on_start {
            match self.inner.recover_active_jobs(&keys).await {
                Ok(recovered) if recovered > 0 => {
                    info!(topic = %topic, recovered, "Recovered jobs from active list");
                }
                Ok(_) => {}
                Err(e) => warn!(topic = %topic, error = %e, "Failed to recover active jobs"),
            }
        }

        let concurrency = concurrency.max(1);
        for i in 0..concurrency {
            self.consumers.spawn(consume(
                consumer_name(topic, registration, i),
                Arc::clone(&self.inner),
                keys.clone(),
                Arc::clone(&handler),
                self.consumers.subscribe(),
            ));
        }

        info!(topic = %topic, concurrency, registration, "Processing topic");
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        if self.consumers.is_closed() {
            return Err(QueueError::ShutDown);
        }
        self.inner.enqueue(&job).await?;
        Ok(job.id)
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        self.consumers.shutdown(timeout).await
    }
}
