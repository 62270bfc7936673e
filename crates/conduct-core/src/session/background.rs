//! Background process supervision.
//!
//! Commands launched with `background = true` are registered here. Each
//! registered process gets two reader tasks that append output chunks as
//! they arrive and a supervisor that records completion. Killing is
//! signalled through an explicit [`CancellationToken`] per process; the
//! supervisor owns the child and performs the actual termination.
//!
//! On completion the supervisor also appends a history entry to the owning
//! session, which is why overlapping background commands appear in history
//! in completion order rather than issuance order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::HistoryEntry;
use crate::error::{Error, Result};

/// Listing entry for one background process.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundProcessInfo {
    pub id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub completed: bool,
    pub exit_code: Option<i32>,
}

/// Accumulated output of one background process.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundOutput {
    pub id: String,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub completed: bool,
    pub exit_code: Option<i32>,
}

/// Mutable state shared between the readers, the supervisor, and snapshots.
#[derive(Debug, Default)]
struct ProcessState {
    stdout: Vec<String>,
    stderr: Vec<String>,
    completed: bool,
    exit_code: Option<i32>,
}

struct ProcessRecord {
    id: String,
    command: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    state: Arc<Mutex<ProcessState>>,
    kill: CancellationToken,
}

/// Per-session registry of background processes.
///
/// Records are removed exactly once, by [`kill`](Self::kill); a process
/// that exits on its own stays listed (completed, with its exit code)
/// until killed or until the owning session is torn down.
pub(crate) struct BackgroundRegistry {
    session: String,
    history: Arc<Mutex<Vec<HistoryEntry>>>,
    processes: Mutex<HashMap<String, ProcessRecord>>,
}

enum OutputStream {
    Stdout,
    Stderr,
}

impl BackgroundRegistry {
    pub fn new(session: impl Into<String>, history: Arc<Mutex<Vec<HistoryEntry>>>) -> Self {
        Self {
            session: session.into(),
            history,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a freshly spawned child and starts its reader and
    /// supervisor tasks. Returns the generated process id.
    pub fn register(&self, command: &str, cwd: PathBuf, mut child: Child, grace: Duration) -> String {
        let id = Uuid::new_v4().to_string();
        let pid = child.id();
        let state = Arc::new(Mutex::new(ProcessState::default()));
        let kill = CancellationToken::new();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(
                stdout,
                Arc::clone(&state),
                OutputStream::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(
                stderr,
                Arc::clone(&state),
                OutputStream::Stderr,
            )));
        }
        tokio::spawn(supervise(Supervised {
            child,
            readers,
            id: id.clone(),
            command: command.to_string(),
            cwd,
            state: Arc::clone(&state),
            kill: kill.clone(),
            grace,
            history: Arc::clone(&self.history),
            started: Instant::now(),
        }));

        debug!(session = %self.session, process = %id, pid, command, "background process started");

        self.processes.lock().insert(
            id.clone(),
            ProcessRecord {
                id: id.clone(),
                command: command.to_string(),
                pid,
                started_at: Utc::now(),
                state,
                kill,
            },
        );
        id
    }

    /// Snapshot of all registered processes.
    pub fn list(&self) -> Vec<BackgroundProcessInfo> {
        self.processes
            .lock()
            .values()
            .map(|record| {
                let state = record.state.lock();
                BackgroundProcessInfo {
                    id: record.id.clone(),
                    command: record.command.clone(),
                    pid: record.pid,
                    started_at: record.started_at,
                    completed: state.completed,
                    exit_code: state.exit_code,
                }
            })
            .collect()
    }

    /// Accumulated output and completion status for one process.
    ///
    /// # Errors
    /// Returns [`Error::ProcessNotFound`] for an unregistered id.
    pub fn output(&self, id: &str) -> Result<BackgroundOutput> {
        let processes = self.processes.lock();
        let record = processes
            .get(id)
            .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;
        let state = record.state.lock();
        Ok(BackgroundOutput {
            id: record.id.clone(),
            stdout: state.stdout.clone(),
            stderr: state.stderr.clone(),
            completed: state.completed,
            exit_code: state.exit_code,
        })
    }

    /// Signals termination and removes the record. Returns `false` for an
    /// unknown id instead of erroring, so callers can kill opportunistically.
    pub fn kill(&self, id: &str) -> bool {
        match self.processes.lock().remove(id) {
            Some(record) => {
                record.kill.cancel();
                debug!(session = %self.session, process = %id, "background process kill requested");
                true
            }
            None => false,
        }
    }

    /// Kills every registered process. Used by session teardown.
    pub fn kill_all(&self) {
        let drained: Vec<ProcessRecord> = self.processes.lock().drain().map(|(_, r)| r).collect();
        for record in drained {
            record.kill.cancel();
        }
    }
}

/// Appends output chunks to the shared state until the stream closes.
async fn pump_output<R>(mut reader: R, state: Arc<Mutex<ProcessState>>, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                let mut state = state.lock();
                match stream {
                    OutputStream::Stdout => state.stdout.push(chunk),
                    OutputStream::Stderr => state.stderr.push(chunk),
                }
            }
        }
    }
}

struct Supervised {
    child: Child,
    readers: Vec<tokio::task::JoinHandle<()>>,
    id: String,
    command: String,
    cwd: PathBuf,
    state: Arc<Mutex<ProcessState>>,
    kill: CancellationToken,
    grace: Duration,
    history: Arc<Mutex<Vec<HistoryEntry>>>,
    started: Instant,
}

/// Owns the child until it exits or a kill is requested, then records the
/// final state and the history entry.
async fn supervise(mut proc: Supervised) {
    let exit_code = tokio::select! {
        status = proc.child.wait() => match status {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(process = %proc.id, error = %err, "failed to reap background process");
                None
            }
        },
        () = proc.kill.cancelled() => {
            terminate(&mut proc.child, proc.grace).await.and_then(|status| status.code())
        }
    };

    // Let the readers drain the final buffered chunks. Bounded, in case a
    // grandchild process inherited the pipe and keeps it open.
    for reader in proc.readers.drain(..) {
        let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
    }

    let (stdout, stderr) = {
        let mut state = proc.state.lock();
        state.completed = true;
        state.exit_code = exit_code;
        (state.stdout.concat(), state.stderr.concat())
    };
    proc.history.lock().push(HistoryEntry {
        command: proc.command,
        timestamp: Utc::now(),
        cwd: proc.cwd,
        stdout,
        stderr,
        exit_code,
        duration_ms: proc.started.elapsed().as_millis() as u64,
    });
    debug!(process = %proc.id, exit_code, "background process finished");
}

/// Stops a child process: termination signal first, forced kill after the
/// grace period. Returns the exit status when the child could be reaped.
pub(crate) async fn terminate(
    child: &mut Child,
    grace: Duration,
) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and still own.
        unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status.ok();
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
    child.wait().await.ok()
}
