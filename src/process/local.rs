//! Process manager supervising children of the current process.
//!
//! Each managed process gets a supervision task that owns the child,
//! restarts it after `restart_delay` when it exits on its own or outgrows
//! `max_memory_restart`, and splits its stdout into status packets (published
//! on the bus) and plain output (appended to the log file).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    BusEvent, LaunchDescriptor, ProcessError, ProcessInfo, ProcessManager, ProcessMessage,
    ProcessRef, ProcessStatus, ProcessTarget,
};
use crate::workgroup::notifier::{StatusPacket, SUPERVISED_ENV};

const BUS_CAPACITY: usize = 256;
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Stop,
    Restart,
    Delete,
}

type ControlRequest = (Control, oneshot::Sender<()>);

struct Entry {
    info: Arc<Mutex<ProcessInfo>>,
    control: mpsc::UnboundedSender<ControlRequest>,
}

/// [`ProcessManager`] backed by `tokio::process`.
pub struct LocalProcessManager {
    log_dir: PathBuf,
    connected: AtomicBool,
    next_id: AtomicU32,
    processes: Mutex<HashMap<u32, Entry>>,
    bus: broadcast::Sender<BusEvent>,
}

impl LocalProcessManager {
    /// Child logs go to `<log_dir>/<name>-<id>.log`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            log_dir: log_dir.into(),
            connected: AtomicBool::new(false),
            next_id: AtomicU32::new(0),
            processes: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Log file of process `id` named `name`.
    pub fn log_path(&self, name: &str, id: u32) -> PathBuf {
        self.log_dir.join(format!("{}-{}.log", name, id))
    }

    fn ensure_connected(&self) -> Result<(), ProcessError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProcessError::NotConnected)
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u32, Entry>>, ProcessError> {
        self.processes
            .lock()
            .map_err(|_| ProcessError::Rpc("process table poisoned".to_string()))
    }

    /// Ids matching `target`, in ascending order.
    fn matching(&self, target: &ProcessTarget) -> Result<Vec<u32>, ProcessError> {
        let processes = self.lock()?;
        let mut ids: Vec<u32> = processes
            .iter()
            .filter(|(_, entry)| {
                entry
                    .info
                    .lock()
                    .map(|info| target.matches(&info))
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        if ids.is_empty() {
            Err(ProcessError::NotFound(target.to_string()))
        } else {
            Ok(ids)
        }
    }

    fn snapshot(&self, ids: &[u32]) -> Result<Vec<ProcessInfo>, ProcessError> {
        let processes = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| processes.get(id))
            .filter_map(|entry| entry.info.lock().ok().map(|info| info.clone()))
            .map(with_memory)
            .collect())
    }

    /// Send `control` to every process matching `target` and wait for each
    /// supervision task to act on it.
    async fn control(
        &self,
        target: &ProcessTarget,
        control: Control,
    ) -> Result<Vec<u32>, ProcessError> {
        self.ensure_connected()?;
        let ids = self.matching(target)?;

        let mut acks = Vec::with_capacity(ids.len());
        {
            let processes = self.lock()?;
            for id in &ids {
                if let Some(entry) = processes.get(id) {
                    let (tx, rx) = oneshot::channel();
                    if entry.control.send((control, tx)).is_ok() {
                        acks.push(rx);
                    }
                }
            }
        }
        for ack in acks {
            // A closed channel means the supervision task already finished.
            let _ = ack.await;
        }
        Ok(ids)
    }
}

fn with_memory(mut info: ProcessInfo) -> ProcessInfo {
    info.memory = info.pid.and_then(resident_memory);
    info
}

/// Resident set size of `pid` in bytes.
#[cfg(target_os = "linux")]
fn resident_memory(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory(_pid: u32) -> Option<u64> {
    None
}

#[async_trait]
impl ProcessManager for LocalProcessManager {
    async fn connect(&self) -> Result<(), ProcessError> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(log_dir = %self.log_dir.display(), "Process manager connected");
        Ok(())
    }

    async fn launch_bus(&self) -> Result<broadcast::Receiver<BusEvent>, ProcessError> {
        self.ensure_connected()?;
        Ok(self.bus.subscribe())
    }

    async fn start(&self, descriptor: LaunchDescriptor) -> Result<Vec<ProcessInfo>, ProcessError> {
        self.ensure_connected()?;
        descriptor.validate()?;

        let mut started = Vec::with_capacity(descriptor.instances as usize);
        for _ in 0..descriptor.instances {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let log_path = self.log_path(&descriptor.name, id);
            let process = ProcessRef {
                id,
                name: descriptor.name.clone(),
            };
            let child = spawn_child(&descriptor, &log_path, process, self.bus.clone())?;

            let info = Arc::new(Mutex::new(ProcessInfo {
                id,
                name: descriptor.name.clone(),
                pid: child.id(),
                status: ProcessStatus::Online,
                restarts: 0,
                memory: None,
                started_at: Some(Utc::now()),
            }));
            let (control, rx) = mpsc::unbounded_channel();

            let supervisor = Supervisor {
                id,
                descriptor: descriptor.clone(),
                log_path,
                info: Arc::clone(&info),
                bus: self.bus.clone(),
                control: rx,
            };
            tokio::spawn(supervisor.run(child));

            info!(name = %descriptor.name, id, "Started process");
            self.lock()?.insert(id, Entry { info, control });
            started.push(id);
        }

        self.snapshot(&started)
    }

    async fn stop(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
        let ids = self.control(target, Control::Stop).await?;
        self.snapshot(&ids)
    }

    async fn restart(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
        let ids = self.control(target, Control::Restart).await?;
        self.snapshot(&ids)
    }

    async fn delete(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
        let ids = self.control(target, Control::Delete).await?;
        let deleted = self.snapshot(&ids)?;

        let mut processes = self.lock()?;
        for info in &deleted {
            processes.remove(&info.id);
            let _ = self.bus.send(BusEvent::Deleted(ProcessRef {
                id: info.id,
                name: info.name.clone(),
            }));
        }
        Ok(deleted)
    }

    async fn describe(&self, target: &ProcessTarget) -> Result<Vec<ProcessInfo>, ProcessError> {
        self.ensure_connected()?;
        let ids = self.matching(target)?;
        self.snapshot(&ids)
    }

    async fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        self.ensure_connected()?;
        let mut ids: Vec<u32> = self.lock()?.keys().copied().collect();
        ids.sort_unstable();
        self.snapshot(&ids)
    }

    /// Move every current log file to `<file>.1`.
    async fn reload_logs(&self) -> Result<(), ProcessError> {
        self.ensure_connected()?;
        let ids: Vec<u32> = self.lock()?.keys().copied().collect();
        let paths: Vec<PathBuf> = self
            .snapshot(&ids)?
            .iter()
            .map(|info| self.log_path(&info.name, info.id))
            .collect();

        for path in paths {
            let mut rotated = path.clone().into_os_string();
            rotated.push(".1");
            match tokio::fs::rename(&path, &rotated).await {
                Ok(()) => debug!(path = %path.display(), "Rotated log"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Drops the link; managed processes keep running.
    async fn disconnect(&self) -> Result<(), ProcessError> {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Process manager disconnected");
        Ok(())
    }
}

fn spawn_child(
    descriptor: &LaunchDescriptor,
    log_path: &Path,
    process: ProcessRef,
    bus: broadcast::Sender<BusEvent>,
) -> Result<Child, ProcessError> {
    let mut command = Command::new(&descriptor.script);
    command
        .args(&descriptor.args)
        .envs(&descriptor.env)
        .env(SUPERVISED_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ProcessError::Spawn(format!("{}: {}", descriptor.script, e)))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_output(stdout, log_path.to_path_buf(), Some((process, bus))));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_output(stderr, log_path.to_path_buf(), None));
    }
    Ok(child)
}

/// Append `line` to the log file, reopening it each time so rotation takes
/// effect immediately.
async fn append_log(path: &Path, line: &str) {
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await
    }
    .await;

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Could not write process log");
    }
}

/// Forward a child stream line by line. Status packets go to `bus` when one
/// is given; everything else is logged.
async fn pump_output<R>(
    stream: R,
    log_path: PathBuf,
    bus: Option<(ProcessRef, broadcast::Sender<BusEvent>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some((process, bus)) = &bus {
            if let Some(packet) = StatusPacket::parse(&line) {
                let _ = bus.send(BusEvent::Message(ProcessMessage {
                    process: process.clone(),
                    data: packet.data,
                }));
                continue;
            }
        }
        append_log(&log_path, &line).await;
    }
}

enum Next {
    Respawn,
    Idle,
    Exit,
}

struct Supervisor {
    id: u32,
    descriptor: LaunchDescriptor,
    log_path: PathBuf,
    info: Arc<Mutex<ProcessInfo>>,
    bus: broadcast::Sender<BusEvent>,
    control: mpsc::UnboundedReceiver<ControlRequest>,
}

impl Supervisor {
    fn update(&self, f: impl FnOnce(&mut ProcessInfo)) {
        if let Ok(mut info) = self.info.lock() {
            f(&mut info);
        }
    }

    fn process_ref(&self) -> ProcessRef {
        ProcessRef {
            id: self.id,
            name: self.descriptor.name.clone(),
        }
    }

    fn spawn(&self) -> Result<Child, ProcessError> {
        let child = spawn_child(
            &self.descriptor,
            &self.log_path,
            self.process_ref(),
            self.bus.clone(),
        )?;
        let pid = child.id();
        self.update(|info| {
            info.pid = pid;
            info.status = ProcessStatus::Online;
            info.started_at = Some(Utc::now());
        });
        Ok(child)
    }

    async fn run(mut self, first: Child) {
        let mut child = Some(first);
        loop {
            let next = match child.take() {
                Some(running) => self.watch(running).await,
                None => match self.spawn() {
                    Ok(running) => self.watch(running).await,
                    Err(e) => {
                        warn!(
                            name = %self.descriptor.name,
                            id = self.id,
                            error = %e,
                            "Could not respawn process"
                        );
                        self.update(|info| {
                            info.pid = None;
                            info.status = ProcessStatus::Errored;
                        });
                        Next::Idle
                    }
                },
            };

            match next {
                Next::Respawn => continue,
                Next::Exit => break,
                Next::Idle => {
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
        debug!(name = %self.descriptor.name, id = self.id, "Supervision finished");
    }

    /// Wait for a command while no child runs. `false` ends supervision.
    async fn idle(&mut self) -> bool {
        while let Some((control, ack)) = self.control.recv().await {
            match control {
                Control::Stop => {
                    let _ = ack.send(());
                }
                Control::Restart => {
                    self.update(|info| info.status = ProcessStatus::Launching);
                    let _ = ack.send(());
                    return true;
                }
                Control::Delete => {
                    let _ = ack.send(());
                    return false;
                }
            }
        }
        false
    }

    async fn watch(&mut self, mut child: Child) -> Next {
        let limit = self.descriptor.memory_limit();
        let mut memory_check = tokio::time::interval(MEMORY_CHECK_INTERVAL);
        memory_check.tick().await;

        loop {
            tokio::select! {
                status = child.wait() => {
                    warn!(
                        name = %self.descriptor.name,
                        id = self.id,
                        status = ?status.ok(),
                        "Process exited; restarting"
                    );
                    self.update(|info| {
                        info.pid = None;
                        info.status = ProcessStatus::Launching;
                    });
                    return self.restart_after_delay().await;
                }
                request = self.control.recv() => {
                    let Some((control, ack)) = request else {
                        terminate(&mut child).await;
                        return Next::Exit;
                    };
                    match control {
                        Control::Stop => {
                            self.update(|info| info.status = ProcessStatus::Stopping);
                            terminate(&mut child).await;
                            self.update(|info| {
                                info.pid = None;
                                info.status = ProcessStatus::Stopped;
                            });
                            let _ = ack.send(());
                            return Next::Idle;
                        }
                        Control::Restart => {
                            terminate(&mut child).await;
                            self.update(|info| {
                                info.pid = None;
                                info.restarts += 1;
                                info.status = ProcessStatus::Launching;
                            });
                            let _ = ack.send(());
                            return Next::Respawn;
                        }
                        Control::Delete => {
                            terminate(&mut child).await;
                            self.update(|info| {
                                info.pid = None;
                                info.status = ProcessStatus::Stopped;
                            });
                            let _ = ack.send(());
                            return Next::Exit;
                        }
                    }
                }
                _ = memory_check.tick(), if limit.is_some() => {
                    let used = child.id().and_then(resident_memory);
                    if let (Some(used), Some(limit)) = (used, limit) {
                        if used > limit {
                            warn!(
                                name = %self.descriptor.name,
                                id = self.id,
                                used,
                                limit,
                                "Process exceeded its memory limit; restarting"
                            );
                            terminate(&mut child).await;
                            self.update(|info| {
                                info.pid = None;
                                info.restarts += 1;
                                info.status = ProcessStatus::Launching;
                            });
                            return Next::Respawn;
                        }
                    }
                }
            }
        }
    }

    /// Sleep `restart_delay`, unless a command arrives first.
    async fn restart_after_delay(&mut self) -> Next {
        let delay = Duration::from_millis(self.descriptor.restart_delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                self.update(|info| info.restarts += 1);
                Next::Respawn
            }
            request = self.control.recv() => match request {
                Some((Control::Stop, ack)) => {
                    self.update(|info| info.status = ProcessStatus::Stopped);
                    let _ = ack.send(());
                    Next::Idle
                }
                Some((Control::Restart, ack)) => {
                    self.update(|info| info.restarts += 1);
                    let _ = ack.send(());
                    Next::Respawn
                }
                Some((Control::Delete, ack)) => {
                    self.update(|info| info.status = ProcessStatus::Stopped);
                    let _ = ack.send(());
                    Next::Exit
                }
                None => Next::Exit,
            }
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Process already gone");
    }
}
