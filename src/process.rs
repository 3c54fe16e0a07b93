use crate::config::SupervisorConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Command line of a supervised process
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Program and arguments
    Argv(Vec<String>),
    /// A command string, split with shell quoting rules (no shell is invoked)
    Shell(String),
}

impl CommandSpec {
    pub fn argv(&self) -> Result<Vec<String>, String> {
        let argv = match self {
            CommandSpec::Argv(argv) => argv.clone(),
            CommandSpec::Shell(line) => shell_words::split(line).map_err(|e| e.to_string())?,
        };
        if argv.is_empty() || argv[0].is_empty() {
            return Err("command is empty".to_string());
        }
        Ok(argv)
    }
}

/// Everything needed to launch one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub id: String,
    pub command: CommandSpec,
    pub working_dir: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Not running, and not scheduled to run
    Stopped,
    /// A child process is alive
    Running,
    /// Exited unexpectedly or failed to spawn
    Errored,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("process {0} doesn't exist")]
    UnknownProcess(String),

    #[error("process {0} is already running")]
    AlreadyRunning(String),

    #[error("process {0} is already stopped")]
    AlreadyStopped(String),

    #[error("duplicate process id: {0}")]
    Duplicate(String),

    #[error("invalid command for process {id}: {message}")]
    InvalidCommand { id: String, message: String },

    #[error("failed to spawn process {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Snapshot of a process for `proc-list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub id: String,
    pub state: ProcessState,
    pub restarts: u32,
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

/// The live child of one run. The child itself is owned by its watcher task.
struct RunHandle {
    seq: u64,
    pid: Option<u32>,
    signal_tx: mpsc::UnboundedSender<StopSignal>,
    exited: watch::Receiver<bool>,
}

struct InstanceInner {
    state: ProcessState,
    restart_count: u32,
    run: Option<RunHandle>,
    run_seq: u64,
    /// Bumped whenever a scheduled restart must no longer fire
    restart_epoch: u64,
    pending_restart: Option<JoinHandle<()>>,
    stability_timer: Option<JoinHandle<()>>,
}

impl InstanceInner {
    fn cancel_pending_restart(&mut self) {
        self.restart_epoch += 1;
        if let Some(handle) = self.pending_restart.take() {
            handle.abort();
        }
    }

    fn cancel_stability_timer(&mut self) {
        if let Some(handle) = self.stability_timer.take() {
            handle.abort();
        }
    }
}

struct ProcessInstance {
    spec: ProcessSpec,
    policy: SupervisorConfig,
    inner: Mutex<InstanceInner>,
}

impl ProcessInstance {
    fn new(spec: ProcessSpec, policy: SupervisorConfig) -> Self {
        Self {
            spec,
            policy,
            inner: Mutex::new(InstanceInner {
                state: ProcessState::Stopped,
                restart_count: 0,
                run: None,
                run_seq: 0,
                restart_epoch: 0,
                pending_restart: None,
                stability_timer: None,
            }),
        }
    }

    fn status(&self) -> ProcessStatus {
        let inner = self.inner.lock();
        ProcessStatus {
            id: self.spec.id.clone(),
            state: inner.state,
            restarts: inner.restart_count,
        }
    }

    fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Running {
            return Err(SupervisorError::AlreadyRunning(self.spec.id.clone()));
        }
        inner.cancel_pending_restart();

        if let Err(e) = self.spawn_locked(&mut inner) {
            inner.state = ProcessState::Errored;
            error!(id = %self.spec.id, error = %e, "Failed to start process");
            return Err(e);
        }
        Ok(())
    }

    /// Spawn a new run. Called with the instance lock held; nothing here awaits.
    fn spawn_locked(self: &Arc<Self>, inner: &mut InstanceInner) -> Result<(), SupervisorError> {
        let id = &self.spec.id;
        let argv = self
            .spec
            .command
            .argv()
            .map_err(|message| SupervisorError::InvalidCommand {
                id: id.clone(),
                message,
            })?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.spec.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.spec.environment {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        {
            if let Some(gid) = self.spec.gid {
                cmd.gid(gid);
            }
            if let Some(uid) = self.spec.uid {
                cmd.uid(uid);
            }
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            id: id.clone(),
            source,
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(id.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(id.clone(), "stderr", stderr));
        }

        inner.run_seq += 1;
        let seq = inner.run_seq;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(Arc::clone(self).watch_child(seq, child, signal_rx, exited_tx));

        inner.run = Some(RunHandle {
            seq,
            pid,
            signal_tx,
            exited: exited_rx,
        });
        inner.state = ProcessState::Running;
        info!(id = %id, pid, command = ?argv, "Started process");

        inner.cancel_stability_timer();
        let instance = Arc::clone(self);
        let window = self.policy.stability_window();
        inner.stability_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut inner = instance.inner.lock();
            let same_run = inner.run.as_ref().is_some_and(|run| run.seq == seq);
            if inner.state == ProcessState::Running && same_run {
                if inner.restart_count > 0 {
                    debug!(id = %instance.spec.id, "Process stable, resetting restart count");
                }
                inner.restart_count = 0;
                inner.stability_timer = None;
            }
        }));

        Ok(())
    }

    /// Owns the child for one run: relays stop signals and reports its exit
    async fn watch_child(
        self: Arc<Self>,
        seq: u64,
        mut child: Child,
        mut signals: mpsc::UnboundedReceiver<StopSignal>,
        exited: watch::Sender<bool>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = signals.recv() => match signal {
                    StopSignal::Terminate => terminate(&mut child),
                    StopSignal::Kill => {
                        if let Err(e) = child.start_kill() {
                            debug!(id = %self.spec.id, error = %e, "SIGKILL failed");
                        }
                    }
                },
            }
        };

        let _ = exited.send(true);
        self.handle_exit(seq, status);
    }

    fn handle_exit(self: &Arc<Self>, seq: u64, status: std::io::Result<ExitStatus>) {
        let mut inner = self.inner.lock();
        if !inner.run.as_ref().is_some_and(|run| run.seq == seq) {
            return;
        }
        inner.run = None;

        match &status {
            Ok(status) => info!(id = %self.spec.id, %status, "Process exited"),
            Err(e) => warn!(id = %self.spec.id, error = %e, "Failed waiting for process"),
        }

        if inner.state != ProcessState::Running {
            return;
        }
        self.crashed(&mut inner);
    }

    /// Record an unexpected exit and schedule the next attempt, if any
    fn crashed(self: &Arc<Self>, inner: &mut InstanceInner) {
        inner.cancel_stability_timer();
        inner.state = ProcessState::Errored;

        if inner.restart_count >= self.policy.restart_limit {
            error!(
                id = %self.spec.id,
                restarts = inner.restart_count,
                "Not restarting anymore, restart limit reached"
            );
            return;
        }

        inner.restart_count += 1;
        let delay = self.policy.backoff_unit() * inner.restart_count;
        info!(
            id = %self.spec.id,
            restarts = inner.restart_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling restart"
        );

        inner.cancel_pending_restart();
        let epoch = inner.restart_epoch;
        let instance = Arc::clone(self);
        inner.pending_restart = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            instance.restart_after_backoff(epoch);
        }));
    }

    fn restart_after_backoff(self: &Arc<Self>, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.restart_epoch != epoch || inner.state != ProcessState::Errored {
            debug!(id = %self.spec.id, "Scheduled restart cancelled");
            return;
        }
        inner.pending_restart = None;

        if let Err(e) = self.spawn_locked(&mut inner) {
            error!(id = %self.spec.id, error = %e, "Failed to restart process");
            self.crashed(&mut inner);
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL
    async fn stop(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let (signal_tx, mut exited, pid) = {
            let mut inner = self.inner.lock();
            if inner.state == ProcessState::Stopped {
                return Err(SupervisorError::AlreadyStopped(self.spec.id.clone()));
            }
            inner.state = ProcessState::Stopped;
            inner.cancel_pending_restart();
            inner.cancel_stability_timer();

            match &inner.run {
                Some(run) => (run.signal_tx.clone(), run.exited.clone(), run.pid),
                None => {
                    info!(id = %self.spec.id, "Process stopped");
                    return Ok(());
                }
            }
        };

        let grace = self.policy.stop_grace();
        info!(id = %self.spec.id, pid, "Sending SIGTERM to process");
        let _ = signal_tx.send(StopSignal::Terminate);

        if tokio::time::timeout(grace, wait_exited(&mut exited)).await.is_err() {
            warn!(
                id = %self.spec.id,
                pid,
                grace_ms = grace.as_millis() as u64,
                "Process didn't stop on SIGTERM, sending SIGKILL"
            );
            let _ = signal_tx.send(StopSignal::Kill);

            if tokio::time::timeout(grace, wait_exited(&mut exited)).await.is_err() {
                error!(id = %self.spec.id, pid, "Process did not exit after SIGKILL");
            }
        }

        info!(id = %self.spec.id, "Process stopped");
        Ok(())
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>) {
    let _ = exited.wait_for(|done| *done).await;
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

/// Forward child output to the log, one line per event
async fn pump_output<R>(id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stream == "stderr" {
                    warn!(target: "process", id = %id, stream, "{}", line);
                } else {
                    info!(target: "process", id = %id, stream, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(id = %id, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

/// Supervises every process declared by the site definitions.
///
/// Returned as `Arc<Self>` since restart and stability timers hold
/// references to their instances.
pub struct Supervisor {
    instances: DashMap<String, Arc<ProcessInstance>>,
    policy: SupervisorConfig,
}

impl Supervisor {
    pub fn new(policy: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            instances: DashMap::new(),
            policy,
        })
    }

    /// Register a process. It starts out Stopped.
    pub fn register(&self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        use dashmap::mapref::entry::Entry;

        match self.instances.entry(spec.id.clone()) {
            Entry::Occupied(_) => Err(SupervisorError::Duplicate(spec.id)),
            Entry::Vacant(slot) => {
                debug!(id = %spec.id, "Registered process");
                slot.insert(Arc::new(ProcessInstance::new(spec, self.policy.clone())));
                Ok(())
            }
        }
    }

    fn instance(&self, id: &str) -> Result<Arc<ProcessInstance>, SupervisorError> {
        self.instances
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SupervisorError::UnknownProcess(id.to_string()))
    }

    pub fn start(&self, id: &str) -> Result<(), SupervisorError> {
        self.instance(id)?.start()
    }

    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        self.instance(id)?.stop().await
    }

    /// Stop (unless already stopped), then start once the stop has completed
    pub async fn restart(&self, id: &str) -> Result<(), SupervisorError> {
        let instance = self.instance(id)?;
        match instance.stop().await {
            Ok(()) | Err(SupervisorError::AlreadyStopped(_)) => {}
            Err(e) => return Err(e),
        }
        instance.start()
    }

    pub fn status(&self, id: &str) -> Option<ProcessStatus> {
        self.instances.get(id).map(|entry| entry.value().status())
    }

    /// All processes, ordered by id
    pub fn list(&self) -> Vec<ProcessStatus> {
        let instances: Vec<Arc<ProcessInstance>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut list: Vec<ProcessStatus> = instances.iter().map(|i| i.status()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Stop every process that is not already stopped, concurrently
    pub async fn shutdown(&self) {
        let instances: Vec<Arc<ProcessInstance>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let stops = instances.iter().map(|instance| async move {
            match instance.stop().await {
                Ok(()) | Err(SupervisorError::AlreadyStopped(_)) => {}
                Err(e) => warn!(id = %instance.spec.id, error = %e, "Failed to stop process"),
            }
        });
        futures::future::join_all(stops).await;
    }

    /// SIGKILL every child that is still alive, without waiting.
    ///
    /// Used when a bounded shutdown runs out of time, since the process is
    /// about to exit without running destructors. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let instances: Vec<Arc<ProcessInstance>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut killed = 0;
        for instance in instances {
            let mut inner = instance.inner.lock();
            inner.state = ProcessState::Stopped;
            inner.cancel_pending_restart();
            inner.cancel_stability_timer();

            let Some(pid) = inner.run.as_ref().and_then(|run| run.pid) else {
                continue;
            };
            warn!(id = %instance.spec.id, pid, "Killing process");
            let result = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            if result == 0 {
                killed += 1;
            } else {
                debug!(id = %instance.spec.id, pid, error = %std::io::Error::last_os_error(), "SIGKILL failed");
            }
        }
        killed
    }
}
