//! Lifecycle wrapper around one worker child process.
//!
//! Status reads are total functions over [`ProcessState`]; they never fail,
//! even while another thread is disposing the process.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::{Error, Result};

use super::framing::MessageFramer;

/// How long `dispose` waits for the process to exit after killing it.
const DISPOSE_WAIT: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and SIGKILL.
#[cfg(unix)]
const TERMINATE_GRACE: Duration = Duration::from_millis(250);

/// Poll interval for exit detection once stdout has closed.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No process attached yet. Reported by the orchestrator before its first
    /// connect and while a swap is in progress.
    NotStarted,
    /// Spawned, handshake pending.
    Connecting,
    /// Handshake received; the endpoint is known.
    Connected,
    /// The OS process exited. `None` when killed by a signal.
    Exited(Option<i32>),
    Disposed,
}

impl ProcessState {
    /// Still waiting for the handshake.
    pub fn is_starting(&self) -> bool {
        matches!(self, ProcessState::NotStarted | ProcessState::Connecting)
    }
}

/// Shared status of a worker, visible to the output reader threads.
#[derive(Debug)]
pub struct StatusCell {
    pid: u32,
    state: watch::Sender<ProcessState>,
    endpoint: OnceLock<String>,
}

impl StatusCell {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            state: watch::Sender::new(ProcessState::Connecting),
            endpoint: OnceLock::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ProcessState::Connected
    }

    /// Base address recorded by the handshake.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.get().map(String::as_str)
    }

    /// Record the handshake. Returns `false` if the process is no longer starting.
    pub fn mark_connected(&self, endpoint: String) -> bool {
        let _ = self.endpoint.set(endpoint);
        self.state.send_if_modified(|state| {
            if state.is_starting() {
                *state = ProcessState::Connected;
                true
            } else {
                false
            }
        })
    }

    fn mark_exited(&self, code: Option<i32>) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ProcessState::Disposed {
                false
            } else {
                *state = ProcessState::Exited(code);
                true
            }
        })
    }

    fn mark_disposed(&self) {
        self.state.send_replace(ProcessState::Disposed);
    }
}

/// Receives framed output and lifecycle notifications from a worker.
pub trait WorkerEvents: Send + Sync + 'static {
    /// A complete stdout message.
    fn on_stdout(&self, status: &StatusCell, message: String);

    /// A complete stderr message.
    fn on_stderr(&self, status: &StatusCell, message: String) {
        tracing::error!(pid = status.pid(), "{}", message);
    }

    /// The process exited on its own (not through `dispose`).
    fn on_exit(&self, _status: &StatusCell) {}
}

/// Handle to a worker process.
pub struct WorkerProcess {
    status: Arc<StatusCell>,
    /// `None` once disposed.
    child: Arc<Mutex<Option<Child>>>,
}

impl WorkerProcess {
    /// Spawn `command` with piped output and start the reader threads.
    pub fn start(mut command: Command, events: Arc<dyn WorkerEvents>) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Connection(format!(
                "worker {} started without output pipes",
                pid
            )));
        };

        let status = Arc::new(StatusCell::new(pid));
        let child = Arc::new(Mutex::new(Some(child)));
        let worker = Self { status, child };

        // Dropping `worker` on error disposes the child.
        {
            let status = worker.status.clone();
            let child = worker.child.clone();
            let events = events.clone();
            thread::Builder::new()
                .name(format!("ember-stdout-{}", pid))
                .spawn(move || {
                    pump(stdout, &status, |s, m| events.on_stdout(s, m));
                    watch_exit(&child, &status, events.as_ref());
                })?;
        }
        {
            let status = worker.status.clone();
            thread::Builder::new()
                .name(format!("ember-stderr-{}", pid))
                .spawn(move || pump(stderr, &status, |s, m| events.on_stderr(s, m)))?;
        }

        Ok(worker)
    }

    pub fn pid(&self) -> u32 {
        self.status.pid()
    }

    pub fn status(&self) -> &StatusCell {
        &self.status
    }

    pub fn state(&self) -> ProcessState {
        self.status.state()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.state(), ProcessState::Exited(_) | ProcessState::Disposed)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.status.endpoint()
    }

    /// Human-readable exit status.
    pub fn exit_status(&self) -> String {
        match self.state() {
            ProcessState::Exited(Some(code)) => format!("exited with code {}", code),
            ProcessState::Exited(None) => "terminated by signal".to_string(),
            ProcessState::Disposed => "disposed".to_string(),
            _ => "not exited".to_string(),
        }
    }

    /// Wait until the handshake arrives, the process exits, or `limit` passes.
    ///
    /// Returns the state observed at that point.
    pub async fn wait_for_handshake(&self, limit: Duration) -> ProcessState {
        let mut rx = self.status.state.subscribe();
        let settled = tokio::time::timeout(limit, rx.wait_for(|state| !state.is_starting())).await;
        match settled {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }

    /// Kill the process if it is still running. Idempotent.
    pub fn kill(&self) {
        let mut guard = lock(&self.child);
        if let Some(child) = guard.as_mut()
            && matches!(child.try_wait(), Ok(None))
            && let Err(e) = child.kill()
        {
            tracing::warn!(pid = self.pid(), "Failed to kill worker: {}", e);
        }
    }

    /// Kill the process, wait (bounded) for it and release the handle. Idempotent.
    pub fn dispose(&self) {
        self.status.mark_disposed();

        let Some(mut child) = lock(&self.child).take() else {
            return;
        };

        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: `child` has not been reaped, so the pid still refers to it.
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
            if wait_bounded(&mut child, TERMINATE_GRACE).is_some() {
                tracing::debug!(pid = self.pid(), "Worker terminated");
                return;
            }
        }

        if let Err(e) = child.kill() {
            tracing::warn!(pid = self.pid(), "Failed to kill worker: {}", e);
        }
        if wait_bounded(&mut child, DISPOSE_WAIT).is_none() {
            tracing::warn!(pid = self.pid(), "Worker did not exit within {:?}", DISPOSE_WAIT);
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid())
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

fn lock(child: &Mutex<Option<Child>>) -> MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read lines from `reader`, frame them and hand complete messages to `dispatch`.
fn pump<R: Read>(reader: R, status: &StatusCell, dispatch: impl Fn(&StatusCell, String)) {
    let mut framer = MessageFramer::new();
    for line in BufReader::new(reader).split(b'\n') {
        let Ok(line) = line else { break };
        if let Some(message) = framer.push_line(&String::from_utf8_lossy(&line)) {
            dispatch(status, message);
        }
    }
    if let Some(rest) = framer.flush() {
        dispatch(status, rest);
    }
}

/// After stdout closes, poll until the child exits or is disposed.
fn watch_exit(child: &Mutex<Option<Child>>, status: &StatusCell, events: &dyn WorkerEvents) {
    loop {
        let exited = match lock(child).as_mut() {
            None => return,
            Some(child) => match child.try_wait() {
                Ok(Some(exit)) => Some(exit.code()),
                Ok(None) => None,
                Err(_) => Some(None),
            },
        };

        if let Some(code) = exited {
            if status.mark_exited(code) {
                events.on_exit(status);
            }
            return;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn wait_bounded(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(exit)) => return Some(exit),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            _ => return None,
        }
    }
}
