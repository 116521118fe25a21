use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use agent_gateway_protocol::ExitReport;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::warn;

use super::lines::LineSplitter;
use super::lines::MAX_LINE_BYTES;
use crate::error::ProcessError;
use crate::ids::UserId;

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// What a consumer attached to a process receives, in order. `Exited` is
/// always the last item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Line(OutputLine),
    Exited(ExitReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "exit_code", rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Terminating,
    Exited(Option<i32>),
}

/// Point-in-time view of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub process_id: u64,
    pub user_id: UserId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlSignal {
    Interrupt,
    Kill,
}

struct ProcessState;
impl ProcessState {
    const STARTING: u8 = 0;
    const RUNNING: u8 = 1;
    const TERMINATING: u8 = 2;
    const EXITED: u8 = 3;
}

/// Where output goes: the attached consumer if there is one, otherwise a
/// bounded backlog replayed on the next attach.
#[derive(Debug)]
struct OutputSlot {
    sink: Option<mpsc::Sender<ProcessOutput>>,
    backlog: VecDeque<ProcessOutput>,
    backlog_capacity: usize,
    dropped: u64,
    detached_since: Option<Instant>,
}

impl OutputSlot {
    fn detach(&mut self) {
        if self.sink.take().is_some() {
            self.detached_since = Some(Instant::now());
        }
    }

    /// The exit report is always kept, even past capacity, so a consumer that
    /// attaches late still learns how the run ended.
    fn buffer(&mut self, item: ProcessOutput) {
        let is_exit = matches!(item, ProcessOutput::Exited(_));
        if self.backlog_capacity == 0 && !is_exit {
            self.dropped += 1;
            return;
        }
        if self.backlog.len() >= self.backlog_capacity.max(1)
            && self.backlog.pop_front().is_some()
        {
            self.dropped += 1;
        }
        self.backlog.push_back(item);
    }
}

#[derive(Debug)]
pub(crate) struct ManagedProcess {
    pub(crate) id: u64,
    pub(crate) user_id: UserId,
    pub(crate) pid: Option<u32>,
    started_at: DateTime<Utc>,
    state: AtomicU8,
    exit_code: StdMutex<Option<i32>>,
    stop_requested: AtomicBool,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    control_tx: mpsc::Sender<ControlSignal>,
    output: Mutex<OutputSlot>,
}

impl ManagedProcess {
    pub(crate) fn new(
        id: u64,
        user_id: UserId,
        pid: Option<u32>,
        stdin_tx: mpsc::Sender<Vec<u8>>,
        control_tx: mpsc::Sender<ControlSignal>,
        sink: mpsc::Sender<ProcessOutput>,
        backlog_capacity: usize,
    ) -> Self {
        Self {
            id,
            user_id,
            pid,
            started_at: Utc::now(),
            state: AtomicU8::new(ProcessState::STARTING),
            exit_code: StdMutex::new(None),
            stop_requested: AtomicBool::new(false),
            stdin_tx,
            control_tx,
            output: Mutex::new(OutputSlot {
                sink: Some(sink),
                backlog: VecDeque::new(),
                backlog_capacity,
                dropped: 0,
                detached_since: None,
            }),
        }
    }

    pub(crate) fn info(&self) -> ProcessInfo {
        ProcessInfo {
            process_id: self.id,
            user_id: self.user_id.clone(),
            pid: self.pid,
            started_at: self.started_at,
            status: self.status(),
        }
    }

    pub(crate) fn status(&self) -> ProcessStatus {
        match self.state.load(Ordering::SeqCst) {
            ProcessState::STARTING => ProcessStatus::Starting,
            ProcessState::RUNNING => ProcessStatus::Running,
            ProcessState::TERMINATING => ProcessStatus::Terminating,
            _ => ProcessStatus::Exited(
                *self
                    .exit_code
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            ),
        }
    }

    pub(crate) fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            ProcessState::STARTING,
            ProcessState::RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_exited(&self, exit_code: Option<i32>) {
        *self
            .exit_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = exit_code;
        self.state.store(ProcessState::EXITED, Ordering::SeqCst);
    }

    pub(crate) fn is_exited(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ProcessState::EXITED
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ProcessState::TERMINATING
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Moves a live process to `Terminating`. Returns false when it was already
    /// terminating or gone.
    fn begin_termination(&self) -> bool {
        for from in [ProcessState::RUNNING, ProcessState::STARTING] {
            if self
                .state
                .compare_exchange(
                    from,
                    ProcessState::TERMINATING,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Interrupts the process and arms the forced-kill escalation.
    pub(crate) fn request_stop(self: &Arc<Self>, grace: Duration) {
        if !self.begin_termination() {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.control_tx.try_send(ControlSignal::Interrupt).is_err() {
            debug!(user_id = %self.user_id, "control channel unavailable for interrupt");
        }
        let process = Arc::clone(self);
        tokio::spawn(async move {
            sleep(grace).await;
            if process.is_exited() {
                return;
            }
            warn!(
                user_id = %process.user_id,
                pid = ?process.pid,
                ?grace,
                "agent process ignored interrupt; forcing kill"
            );
            let _ = process.control_tx.send(ControlSignal::Kill).await;
        });
    }

    /// Queues bytes for the stdin writer without waiting. A child that stops
    /// reading its stdin fills the queue, and the caller is told so instead of
    /// being parked behind it.
    pub(crate) fn send_stdin(&self, bytes: Vec<u8>) -> Result<(), ProcessError> {
        self.stdin_tx.try_send(bytes).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ProcessError::StdinBusy,
            mpsc::error::TrySendError::Closed(_) => ProcessError::StdinClosed,
        })
    }

    /// Delivers one item to the attached consumer, falling back to the backlog
    /// when nobody is listening. Returns false when the item was buffered.
    pub(crate) async fn dispatch(&self, item: ProcessOutput) -> bool {
        let mut slot = self.output.lock().await;
        let rejected = match slot.sink.as_ref() {
            Some(sink) => match sink.send(item).await {
                Ok(()) => return true,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };
        if slot.sink.is_some() {
            debug!(user_id = %self.user_id, "output consumer went away; buffering");
        }
        slot.detach();
        slot.buffer(rejected);
        false
    }

    /// Installs a new consumer and hands back whatever was buffered while
    /// detached, together with the number of lines that did not fit.
    pub(crate) async fn attach(&self, sink: mpsc::Sender<ProcessOutput>) -> (Vec<ProcessOutput>, u64) {
        let mut slot = self.output.lock().await;
        slot.sink = Some(sink);
        slot.detached_since = None;
        let dropped = std::mem::take(&mut slot.dropped);
        (slot.backlog.drain(..).collect(), dropped)
    }

    /// How long the process has gone without a live consumer.
    pub(crate) async fn detached_for(&self) -> Option<Duration> {
        let mut slot = self.output.lock().await;
        if slot.sink.as_ref().is_some_and(mpsc::Sender::is_closed) {
            slot.detach();
        }
        slot.detached_since
            .map(|since| Instant::now().saturating_duration_since(since))
    }
}

pub(crate) async fn read_lines<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(?stream, "agent output read failed: {err}");
                break;
            }
        };
        for text in splitter.push_bytes(&buf[..n]) {
            if tx.send(OutputLine { stream, text }).await.is_err() {
                return;
            }
        }
    }
    if let Some(text) = splitter.finish() {
        let _ = tx.send(OutputLine { stream, text }).await;
    }
}

pub(crate) async fn pump_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = stdin.write_all(&bytes).await {
            debug!("agent stdin closed: {err}");
            break;
        }
        if let Err(err) = stdin.flush().await {
            debug!("agent stdin flush failed: {err}");
            break;
        }
    }
}

pub(crate) fn deliver_signal(child: &mut Child, signal: ControlSignal) {
    match signal {
        ControlSignal::Interrupt => interrupt(child),
        ControlSignal::Kill => {
            #[cfg(unix)]
            signal_group(child, libc::SIGKILL);
            if let Err(err) = child.start_kill() {
                warn!("failed to kill agent process: {err}");
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if !signal_group(child, libc::SIGINT) {
        warn!(pid = ?child.id(), "failed to interrupt agent process group");
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!("failed to stop agent process: {err}");
    }
}

/// The child is spawned as the leader of its own process group, so signalling
/// the group also reaches the tools it launched.
#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> bool {
    let Some(pgid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: killpg takes plain integers and touches no memory. The group id
    // is the pid of a child we have not reaped yet, so it cannot be recycled.
    unsafe { libc::killpg(pgid, signal) == 0 }
}

#[cfg(unix)]
pub(crate) fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
