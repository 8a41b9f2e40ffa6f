//! Timer-driven workers.
//!
//! [`CronTimer`] runs a tick handler on a cron schedule (seconds field first,
//! evaluated in UTC). [`CronWorker`] composes a timer with a plain
//! [`Worker`], so a timer-driven component still owns a queue, logger and
//! checkpointer, and may also process topics.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{HandlerRef, Worker, WorkerError};
use crate::component::Component;
use crate::error::ComponentError;
use crate::logger::Logger;
use crate::queue::panic_message;

/// Handler run on every timer tick.
pub type TickHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`TickHandler`].
pub fn tick_handler<F, Fut>(f: F) -> TickHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Timer configuration, read from a worker's `cron` option block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronOptions {
    pub cron_time: String,
    /// Name of a tick handler registered on the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_tick: Option<String>,
    /// Name of a tick handler run when the timer is paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<String>,
    /// Only `UTC` is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl CronOptions {
    pub fn new(cron_time: impl Into<String>) -> Self {
        Self {
            cron_time: cron_time.into(),
            on_tick: None,
            on_complete: None,
            time_zone: None,
        }
    }

    /// Parse the schedule expression.
    pub fn schedule(&self) -> Result<Schedule, WorkerError> {
        if let Some(zone) = &self.time_zone {
            if !matches!(zone.as_str(), "UTC" | "Etc/UTC") {
                return Err(WorkerError::InvalidSchedule {
                    expr: self.cron_time.clone(),
                    reason: format!("unsupported time zone '{}'", zone),
                });
            }
        }
        Schedule::from_str(&self.cron_time).map_err(|e| WorkerError::InvalidSchedule {
            expr: self.cron_time.clone(),
            reason: e.to_string(),
        })
    }
}

struct RunningTimer {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Recurring timer invoking a tick handler.
pub struct CronTimer {
    schedule: Schedule,
    on_tick: TickHandler,
    on_complete: Option<TickHandler>,
    logger: Arc<dyn Logger>,
    running: Mutex<Option<RunningTimer>>,
}

impl CronTimer {
    pub fn new(schedule: Schedule, on_tick: TickHandler, logger: Arc<dyn Logger>) -> Self {
        Self {
            schedule,
            on_tick,
            on_complete: None,
            logger,
            running: Mutex::new(None),
        }
    }

    pub fn with_on_complete(mut self, on_complete: TickHandler) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| matches!(&*running, Some(t) if !t.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Start the timer. Must be called from within a tokio runtime; starting
    /// a running timer does nothing.
    pub fn start(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if matches!(&*running, Some(t) if !t.handle.is_finished()) {
            return;
        }

        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(run_timer(
            self.schedule.clone(),
            Arc::clone(&self.on_tick),
            Arc::clone(&self.logger),
            stopped,
        ));
        *running = Some(RunningTimer { stop, handle });
    }

    /// Stop the timer; fires `on_complete` if the timer was running.
    pub fn stop(&self) {
        let timer = self.running.lock().ok().and_then(|mut running| running.take());
        let Some(timer) = timer else {
            return;
        };
        let _ = timer.stop.send(());

        if let Some(on_complete) = &self.on_complete {
            tokio::spawn(run_tick(Arc::clone(on_complete), Arc::clone(&self.logger)));
        }
    }
}

impl Drop for CronTimer {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(timer) = running.take() {
                timer.handle.abort();
            }
        }
    }
}

async fn run_timer(
    schedule: Schedule,
    on_tick: TickHandler,
    logger: Arc<dyn Logger>,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut last: DateTime<Utc> = Utc::now();

    loop {
        let from = last.max(Utc::now());
        let Some(next) = schedule.after(&from).next() else {
            logger.info("CRON schedule has no further fire times.");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = &mut stopped => return,
            _ = tokio::time::sleep(wait) => {}
        }

        last = next;
        run_tick(Arc::clone(&on_tick), Arc::clone(&logger)).await;
    }
}

async fn run_tick(handler: TickHandler, logger: Arc<dyn Logger>) {
    if let Err(panic) = AssertUnwindSafe(handler()).catch_unwind().await {
        logger.error(&format!(
            "CRON tick failed due to unhandled panic: {}.",
            panic_message(panic.as_ref())
        ));
    }
}

/// A worker whose activity is driven by a [`CronTimer`].
pub struct CronWorker {
    worker: Worker,
    timer: CronTimer,
}

impl CronWorker {
    /// Compose a timer with `worker`.
    ///
    /// `on_tick`/`on_complete` names in `options` are resolved against the
    /// worker's tick handlers; without `on_tick`, `default_tick` runs.
    pub fn new(
        worker: Worker,
        options: &CronOptions,
        default_tick: TickHandler,
    ) -> Result<Self, WorkerError> {
        let schedule = options.schedule()?;
        let on_tick = match &options.on_tick {
            Some(name) => worker.handlers().tick(HandlerRef::from(name.as_str()))?,
            None => default_tick,
        };

        let mut timer = CronTimer::new(schedule, on_tick, Arc::clone(worker.logger()));
        if let Some(name) = &options.on_complete {
            let on_complete = worker.handlers().tick(HandlerRef::from(name.as_str()))?;
            timer = timer.with_on_complete(on_complete);
        }

        Ok(Self { worker, timer })
    }

    /// Compose using the timer configuration under the worker's `cron`
    /// option.
    pub fn from_worker_options(
        worker: Worker,
        default_tick: TickHandler,
    ) -> Result<Self, ComponentError> {
        let options = worker.options().get("cron").cloned().ok_or_else(|| {
            ComponentError::InvalidOptions {
                component: worker.name().to_string(),
                reason: "\"cron\" is required".to_string(),
            }
        })?;
        let options: CronOptions =
            serde_json::from_value(options).map_err(|e| ComponentError::InvalidOptions {
                component: worker.name().to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::new(worker, &options, default_tick)?)
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn timer(&self) -> &CronTimer {
        &self.timer
    }

    pub fn pause(&self) {
        self.worker.logger().info("Stopping the CRON timer.");
        self.timer.stop();
    }

    pub fn resume(&self) {
        self.worker.logger().info("Resuming the CRON timer.");
        self.timer.start();
    }
}

#[async_trait]
impl Component for CronWorker {
    fn name(&self) -> &str {
        self.worker.name()
    }

    async fn init(&self) -> Result<(), ComponentError> {
        self.timer.start();
        Ok(())
    }

    async fn stop(&self) -> Result<(), ComponentError> {
        self.timer.stop();
        Ok(())
    }
}
