//! Per-user agent process supervision.
//!
//! At most one process runs per user. Output is split into lines and handed to
//! whichever consumer is attached; while nobody is attached it is kept in a
//! bounded backlog. The process outlives the socket that started it.

mod lines;
mod process;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use agent_gateway_protocol::ExitReport;
use agent_gateway_protocol::TaskParams;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use process::OutputLine;
pub use process::OutputStream;
pub use process::ProcessInfo;
pub use process::ProcessOutput;
pub use process::ProcessStatus;

use process::ControlSignal;
use process::ManagedProcess;
use process::deliver_signal;
use process::exit_signal;
use process::pump_stdin;
use process::read_lines;

use crate::config::AgentConfig;
use crate::error::ProcessError;
use crate::ids::UserId;

/// Environment variable carrying the task parameters as JSON.
pub const TASK_PARAMS_ENV: &str = "AGENT_TASK_PARAMS";
/// Environment variable carrying the id of the user the process runs for.
pub const USER_ID_ENV: &str = "AGENT_USER_ID";

const LINE_CHANNEL_CAPACITY: usize = 256;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const STDIN_CHANNEL_CAPACITY: usize = 64;
const CONTROL_CHANNEL_CAPACITY: usize = 8;
const EXIT_CHANNEL_CAPACITY: usize = 64;
/// How long the pipes may stay silent after the child exits before the readers
/// are abandoned. A grandchild holding a pipe open must not delay the exit
/// notification forever. Time spent waiting on a slow consumer does not count.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

/// A consumer's handle on a process: the output buffered before it attached,
/// then a live stream that ends with [`ProcessOutput::Exited`].
#[derive(Debug)]
pub struct ProcessAttachment {
    pub info: ProcessInfo,
    pub replay: Vec<ProcessOutput>,
    /// Lines that overflowed the backlog while nothing was attached.
    pub dropped_lines: u64,
    pub output: mpsc::Receiver<ProcessOutput>,
}

/// Broadcast to every subscriber once a process has exited and its slot is
/// free again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub user_id: UserId,
    pub process_id: u64,
    pub report: ExitReport,
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

#[derive(Debug)]
struct SupervisorInner {
    config: AgentConfig,
    next_process_id: AtomicU64,
    processes: Mutex<HashMap<UserId, Arc<ManagedProcess>>>,
    /// Processes that exited with nobody attached, kept until the user attaches
    /// or starts a new run so the output tail and exit report are not lost.
    finished: Mutex<HashMap<UserId, Arc<ManagedProcess>>>,
    exits: broadcast::Sender<ProcessExit>,
}

impl ProcessSupervisor {
    pub fn new(config: AgentConfig) -> Self {
        let (exits, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                next_process_id: AtomicU64::new(1),
                processes: Mutex::new(HashMap::new()),
                finished: Mutex::new(HashMap::new()),
                exits,
            }),
        }
    }

    /// Spawns the agent for `user_id`. The caller becomes the attached
    /// consumer.
    ///
    /// The check for an existing process and the insertion of the new one
    /// happen under the same lock, so two concurrent starts for one user
    /// yield exactly one process.
    pub async fn start(
        &self,
        user_id: UserId,
        params: TaskParams,
    ) -> Result<ProcessAttachment, ProcessError> {
        let mut processes = self.inner.processes.lock().await;
        if processes.contains_key(&user_id) {
            return Err(ProcessError::AlreadyRunning { user_id });
        }

        let params_json = serde_json::to_string(&params)
            .map_err(|source| ProcessError::InvalidParams { source })?;
        let mut child = self
            .inner
            .build_command(&user_id, &params_json)
            .spawn()
            .map_err(ProcessError::spawn)?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| {
            ProcessError::spawn(std::io::Error::other(
                "stdout pipe was unexpectedly not available",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ProcessError::spawn(std::io::Error::other(
                "stderr pipe was unexpectedly not available",
            ))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ProcessError::spawn(std::io::Error::other(
                "stdin pipe was unexpectedly not available",
            ))
        })?;

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let process_id = self.inner.next_process_id.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new(ManagedProcess::new(
            process_id,
            user_id.clone(),
            pid,
            stdin_tx,
            control_tx,
            output_tx,
            self.inner.config.backlog_lines,
        ));

        let readers = vec![
            tokio::spawn(read_lines(stdout, OutputStream::Stdout, line_tx.clone())),
            tokio::spawn(read_lines(stderr, OutputStream::Stderr, line_tx)),
        ];
        tokio::spawn(pump_stdin(stdin, stdin_rx));
        tokio::spawn(supervise(
            Arc::clone(&self.inner),
            Arc::clone(&process),
            child,
            control_rx,
            line_rx,
            readers,
        ));

        process.mark_running();
        processes.insert(user_id.clone(), Arc::clone(&process));
        self.inner.finished.lock().await.remove(&user_id);
        drop(processes);

        if let Some(timeout) = self.inner.config.orphan_timeout() {
            spawn_orphan_watchdog(Arc::clone(&process), timeout, self.stop_grace());
        }

        info!(%user_id, ?pid, process_id, "agent process started");
        Ok(ProcessAttachment {
            info: process.info(),
            replay: Vec::new(),
            dropped_lines: 0,
            output: output_rx,
        })
    }

    /// Asks the user's process to stop: interrupt first, kill once the grace
    /// period runs out. Returns false when there is no process to stop.
    pub async fn stop(&self, user_id: &UserId) -> bool {
        let Some(process) = self.lookup(user_id).await else {
            return false;
        };
        if process.is_exited() {
            return false;
        }
        info!(%user_id, pid = ?process.pid, "stopping agent process");
        process.request_stop(self.stop_grace());
        true
    }

    pub async fn write_stdin(&self, user_id: &UserId, bytes: Vec<u8>) -> Result<(), ProcessError> {
        let process = self
            .lookup(user_id)
            .await
            .filter(|process| !process.is_exited())
            .ok_or_else(|| ProcessError::NotRunning {
                user_id: user_id.clone(),
            })?;
        process.send_stdin(bytes)
    }

    /// Makes the caller the consumer of the user's process output, replacing
    /// any previous consumer.
    ///
    /// A process that exited while nobody was attached can be attached to
    /// once: its replay ends with [`ProcessOutput::Exited`].
    pub async fn attach(&self, user_id: &UserId) -> Option<ProcessAttachment> {
        let process = match self.lookup(user_id).await {
            Some(process) => process,
            None => self.inner.finished.lock().await.remove(user_id)?,
        };
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (replay, dropped_lines) = process.attach(tx).await;
        debug!(%user_id, replayed = replay.len(), dropped_lines, "attached to agent process");
        Some(ProcessAttachment {
            info: process.info(),
            replay,
            dropped_lines,
            output: rx,
        })
    }

    pub async fn get(&self, user_id: &UserId) -> Option<ProcessInfo> {
        self.lookup(user_id).await.map(|process| process.info())
    }

    /// The user's last process, if it exited while detached and nobody has
    /// attached to it since.
    pub async fn unclaimed_exit(&self, user_id: &UserId) -> Option<ProcessInfo> {
        self.inner
            .finished
            .lock()
            .await
            .get(user_id)
            .map(|process| process.info())
    }

    pub async fn list(&self) -> Vec<ProcessInfo> {
        let processes = self.inner.processes.lock().await;
        let mut infos: Vec<ProcessInfo> = processes.values().map(|process| process.info()).collect();
        infos.sort_by_key(|info| info.process_id);
        infos
    }

    pub fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit> {
        self.inner.exits.subscribe()
    }

    /// Stops every process and waits for them to exit, bounded by the grace
    /// period plus a little slack for the forced kill.
    pub async fn shutdown(&self) {
        let processes: Vec<Arc<ManagedProcess>> =
            self.inner.processes.lock().await.values().cloned().collect();
        if processes.is_empty() {
            return;
        }
        info!(count = processes.len(), "stopping agent processes");
        let grace = self.stop_grace();
        for process in &processes {
            process.request_stop(grace);
        }
        let deadline = Instant::now() + grace + SHUTDOWN_SLACK;
        while Instant::now() < deadline {
            if self.inner.processes.lock().await.is_empty() {
                return;
            }
            sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        warn!("agent processes still running after shutdown deadline");
    }

    fn stop_grace(&self) -> Duration {
        self.inner.config.stop_grace()
    }

    async fn lookup(&self, user_id: &UserId) -> Option<Arc<ManagedProcess>> {
        self.inner.processes.lock().await.get(user_id).cloned()
    }
}

impl SupervisorInner {
    fn build_command(&self, user_id: &UserId, params_json: &str) -> Command {
        let config = &self.config;
        let mut command = Command::new(&config.program);
        command.args(&config.args);
        if let Some(flag) = &config.params_arg {
            command.arg(flag).arg(params_json);
        }
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        command
            .envs(&config.env)
            .env(TASK_PARAMS_ENV, params_json)
            .env(USER_ID_ENV, user_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// Frees the user's slot, unless it has already been taken by a newer
    /// process.
    async fn remove(&self, process: &ManagedProcess) {
        let mut processes = self.processes.lock().await;
        if processes
            .get(&process.user_id)
            .is_some_and(|entry| entry.id == process.id)
        {
            processes.remove(&process.user_id);
        }
    }

    /// Parks an exited process for a later attach, unless the user has
    /// already started a new one.
    async fn keep_finished(&self, process: &Arc<ManagedProcess>) {
        let processes = self.processes.lock().await;
        if !processes.contains_key(&process.user_id) {
            self.finished
                .lock()
                .await
                .insert(process.user_id.clone(), Arc::clone(process));
        }
    }
}

/// Owns the child: applies control signals and reports the exit once the
/// output has been delivered.
///
/// Output is forwarded on its own task, so a consumer that reads slowly (or
/// not at all) never holds up a signal.
async fn supervise(
    inner: Arc<SupervisorInner>,
    process: Arc<ManagedProcess>,
    mut child: Child,
    mut control_rx: mpsc::Receiver<ControlSignal>,
    line_rx: mpsc::Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
) {
    let (exited_tx, exited_rx) = oneshot::channel();
    let forwarder = tokio::spawn(forward_output(
        Arc::clone(&process),
        line_rx,
        readers,
        exited_rx,
    ));

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = control_rx.recv() => {
                debug!(user_id = %process.user_id, ?signal, "signalling agent process");
                deliver_signal(&mut child, signal);
            }
        }
    };
    let (exit_code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(err) => {
            warn!(user_id = %process.user_id, "failed to wait for agent process: {err}");
            (None, None)
        }
    };
    process.mark_exited(exit_code);
    let _ = exited_tx.send(());
    if let Err(err) = forwarder.await {
        warn!(user_id = %process.user_id, "agent output forwarder failed: {err}");
    }
    inner.remove(&process).await;

    let report = ExitReport::new(exit_code, signal, process.stop_requested());
    info!(
        user_id = %process.user_id,
        pid = ?process.pid,
        status = ?report.status,
        ?exit_code,
        ?signal,
        "agent process exited"
    );
    if !process.dispatch(ProcessOutput::Exited(report.clone())).await {
        debug!(user_id = %process.user_id, "no consumer attached at exit; keeping the report");
        inner.keep_finished(&process).await;
    }
    let _ = inner.exits.send(ProcessExit {
        user_id: process.user_id.clone(),
        process_id: process.id,
        report,
    });
}

/// Hands every line to the consumer until both pipes close. Once the child has
/// exited the pipes get [`OUTPUT_DRAIN_TIMEOUT`] of silence before the readers
/// are abandoned; the timer restarts with every line.
async fn forward_output(
    process: Arc<ManagedProcess>,
    mut line_rx: mpsc::Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    mut exited: oneshot::Receiver<()>,
) {
    let mut child_exited = false;
    loop {
        let line = if child_exited {
            match timeout(OUTPUT_DRAIN_TIMEOUT, line_rx.recv()).await {
                Ok(line) => line,
                Err(_) => {
                    warn!(user_id = %process.user_id, "agent output still open after exit; dropping the rest");
                    break;
                }
            }
        } else {
            tokio::select! {
                line = line_rx.recv() => line,
                _ = &mut exited => {
                    child_exited = true;
                    continue;
                }
            }
        };
        match line {
            Some(line) => {
                process.dispatch(ProcessOutput::Line(line)).await;
            }
            None => break,
        }
    }
    for reader in readers {
        reader.abort();
    }
}

fn spawn_orphan_watchdog(process: Arc<ManagedProcess>, timeout: Duration, grace: Duration) {
    tokio::spawn(async move {
        loop {
            sleep(ORPHAN_CHECK_INTERVAL.min(timeout)).await;
            if process.is_exited() || process.is_terminating() {
                break;
            }
            if let Some(detached) = process.detached_for().await
                && detached >= timeout
            {
                info!(
                    user_id = %process.user_id,
                    detached_secs = detached.as_secs(),
                    "stopping agent process with no attached session"
                );
                process.request_stop(grace);
                break;
            }
        }
    });
}
