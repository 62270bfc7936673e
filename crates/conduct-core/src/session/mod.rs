//! Command-execution sessions.
//!
//! A [`Session`] binds a working directory and environment to the commands
//! issued through it. The built-in `cd` mutates the session directory
//! without spawning a subprocess; every other command runs as `sh -c` with
//! the session's cwd and environment. Commands launched with
//! `background = true` are tracked in the session's [`background`] registry
//! and polled later.
//!
//! A session is a cheap-clone handle. Working-directory updates are not
//! synchronized against overlapping commands on the same session: callers
//! that care about `cd` sequencing must issue commands one at a time.

pub mod background;
pub mod manager;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::Limits;
use crate::error::{Error, Result};

use background::{BackgroundOutput, BackgroundProcessInfo, BackgroundRegistry};

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overrides the configured command timeout.
    pub timeout: Option<Duration>,
    /// Run without waiting; output accumulates in the background registry.
    pub background: bool,
    /// One-shot working directory override. The session cwd is unchanged.
    pub cwd: Option<PathBuf>,
}

/// Result of one completed (or backgrounded) command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` while a background command is still running.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_id: Option<String>,
}

/// One executed-command record in a session's history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Incremental output delivered to streaming callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Stdout(String),
    Stderr(String),
    /// Spawn error or timeout notice; the call still resolves normally.
    Error(String),
}

/// Final resolution of a streaming execution.
#[derive(Debug, Clone, Copy)]
pub struct StreamResult {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

struct SessionInner {
    id: String,
    env: HashMap<String, String>,
    limits: Limits,
    cwd: Mutex<PathBuf>,
    /// Shared with the background registry so supervisors can append
    /// completion records.
    history: Arc<Mutex<Vec<HistoryEntry>>>,
    background: BackgroundRegistry,
}

/// An execution context with a stable working directory.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: impl Into<String>,
        cwd: PathBuf,
        env_overrides: &HashMap<String, String>,
        limits: Limits,
    ) -> Self {
        let id = id.into();
        let mut env: HashMap<String, String> = std::env::vars().collect();
        for (key, value) in env_overrides {
            env.insert(key.clone(), value.clone());
        }
        let history = Arc::new(Mutex::new(Vec::new()));
        Self {
            inner: Arc::new(SessionInner {
                background: BackgroundRegistry::new(id.clone(), Arc::clone(&history)),
                id,
                env,
                limits,
                cwd: Mutex::new(cwd),
                history,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current working directory of the session.
    pub fn cwd(&self) -> PathBuf {
        self.inner.cwd.lock().clone()
    }

    /// Snapshot of the executed-command history, in completion order.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Executes a command and waits for it (unless backgrounded).
    ///
    /// `cd` is handled in-process: the target is quote-stripped,
    /// `~`-expanded, resolved against the session cwd, and stat-checked.
    /// A missing or non-directory target yields a structured failure
    /// (exit code 1, stderr populated) and leaves the cwd unchanged.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] when the time budget is exceeded and
    /// [`Error::BufferOverflow`] when combined output exceeds the cap.
    /// Spawn failures are structured results, not errors.
    pub async fn execute(&self, command: &str, options: ExecOptions) -> Result<CommandResult> {
        let trimmed = command.trim();
        if let Some(target) = parse_cd(trimmed) {
            return Ok(self.change_directory(trimmed, target));
        }
        if options.background {
            return Ok(self.spawn_background(trimmed, options.cwd));
        }
        self.run_foreground(trimmed, &options).await
    }

    /// Executes a command, delivering output incrementally through
    /// `on_chunk` instead of buffering it.
    ///
    /// The `cd` special case behaves exactly as in [`execute`](Self::execute),
    /// with the resolved directory delivered as a stdout chunk. Spawn errors
    /// and timeouts are delivered as [`StreamEvent::Error`] and the call
    /// still resolves with an exit code and duration.
    ///
    /// # Errors
    /// Currently infallible in practice; the `Result` keeps the signature
    /// aligned with [`execute`](Self::execute) for wrapper code.
    pub async fn execute_streaming<F>(
        &self,
        command: &str,
        mut on_chunk: F,
        options: ExecOptions,
    ) -> Result<StreamResult>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let trimmed = command.trim();
        if let Some(target) = parse_cd(trimmed) {
            let result = self.change_directory(trimmed, target);
            if result.exit_code == Some(0) {
                on_chunk(StreamEvent::Stdout(result.stdout));
            } else {
                on_chunk(StreamEvent::Stderr(result.stderr));
            }
            return Ok(StreamResult {
                exit_code: result.exit_code,
                duration_ms: 0,
            });
        }

        let started = Instant::now();
        let cwd = options.cwd.clone().unwrap_or_else(|| self.cwd());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.limits.command_timeout());

        let mut child = match self.spawn(trimmed, &cwd) {
            Ok(child) => child,
            Err(err) => {
                on_chunk(StreamEvent::Error(format!("failed to spawn: {err}")));
                return Ok(StreamResult {
                    exit_code: Some(127),
                    duration_ms: elapsed_ms(started),
                });
            }
        };
        let Some(mut stdout) = child.stdout.take() else {
            on_chunk(StreamEvent::Error("stdout pipe unavailable".to_string()));
            return Ok(StreamResult {
                exit_code: Some(127),
                duration_ms: elapsed_ms(started),
            });
        };
        let Some(mut stderr) = child.stderr.take() else {
            on_chunk(StreamEvent::Error("stderr pipe unavailable".to_string()));
            return Ok(StreamResult {
                exit_code: Some(127),
                duration_ms: elapsed_ms(started),
            });
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];

        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(n) => on_chunk(StreamEvent::Stdout(
                        String::from_utf8_lossy(&out_buf[..n]).into_owned(),
                    )),
                },
                read = stderr.read(&mut err_buf), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => on_chunk(StreamEvent::Stderr(
                        String::from_utf8_lossy(&err_buf[..n]).into_owned(),
                    )),
                },
                () = tokio::time::sleep_until(deadline) => {
                    on_chunk(StreamEvent::Error(timeout_message(timeout)));
                    background::terminate(&mut child, self.inner.limits.kill_grace()).await;
                    return Ok(StreamResult { exit_code: None, duration_ms: elapsed_ms(started) });
                }
            }
        }

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => Ok(StreamResult {
                exit_code: status.code(),
                duration_ms: elapsed_ms(started),
            }),
            Ok(Err(err)) => {
                on_chunk(StreamEvent::Error(format!("failed to reap process: {err}")));
                Ok(StreamResult {
                    exit_code: None,
                    duration_ms: elapsed_ms(started),
                })
            }
            Err(_) => {
                on_chunk(StreamEvent::Error(timeout_message(timeout)));
                background::terminate(&mut child, self.inner.limits.kill_grace()).await;
                Ok(StreamResult {
                    exit_code: None,
                    duration_ms: elapsed_ms(started),
                })
            }
        }
    }

    /// Snapshot of this session's background processes.
    pub fn list_background(&self) -> Vec<BackgroundProcessInfo> {
        self.inner.background.list()
    }

    /// Accumulated output for one background process.
    ///
    /// # Errors
    /// Returns [`Error::ProcessNotFound`] for an unregistered id.
    pub fn background_output(&self, id: &str) -> Result<BackgroundOutput> {
        self.inner.background.output(id)
    }

    /// Kills one background process and removes its record. Returns
    /// `false` for an unknown id.
    pub fn kill_background(&self, id: &str) -> bool {
        self.inner.background.kill(id)
    }

    /// Kills every background process owned by this session.
    pub fn kill_all_background(&self) {
        self.inner.background.kill_all();
    }

    fn spawn(&self, command: &str, cwd: &Path) -> std::io::Result<Child> {
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .env_clear()
            .envs(&self.inner.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn spawn_background(&self, command: &str, cwd_override: Option<PathBuf>) -> CommandResult {
        let cwd = cwd_override.unwrap_or_else(|| self.cwd());
        match self.spawn(command, &cwd) {
            Ok(child) => {
                let id = self.inner.background.register(
                    command,
                    cwd,
                    child,
                    self.inner.limits.kill_grace(),
                );
                CommandResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    duration_ms: 0,
                    background: true,
                    background_id: Some(id),
                }
            }
            Err(err) => spawn_failure(&err),
        }
    }

    async fn run_foreground(&self, command: &str, options: &ExecOptions) -> Result<CommandResult> {
        let started = Instant::now();
        let issued_in = self.cwd();
        let cwd = options.cwd.clone().unwrap_or_else(|| issued_in.clone());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.limits.command_timeout());
        let cap = self.inner.limits.output_cap_bytes;
        let grace = self.inner.limits.kill_grace();

        let mut child = match self.spawn(command, &cwd) {
            Ok(child) => child,
            Err(err) => return Ok(spawn_failure(&err)),
        };
        let Some(mut stdout) = child.stdout.take() else {
            return Ok(pipe_failure("stdout"));
        };
        let Some(mut stderr) = child.stderr.take() else {
            return Ok(pipe_failure("stderr"));
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];

        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(n) => {
                        stdout_buf.extend_from_slice(&out_buf[..n]);
                        if stdout_buf.len() + stderr_buf.len() > cap {
                            background::terminate(&mut child, grace).await;
                            return Err(Error::BufferOverflow { limit: cap });
                        }
                    }
                },
                read = stderr.read(&mut err_buf), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => {
                        stderr_buf.extend_from_slice(&err_buf[..n]);
                        if stdout_buf.len() + stderr_buf.len() > cap {
                            background::terminate(&mut child, grace).await;
                            return Err(Error::BufferOverflow { limit: cap });
                        }
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    background::terminate(&mut child, grace).await;
                    return Err(timeout_error(command, timeout));
                }
            }
        }

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Ok(spawn_failure(&err)),
            Err(_) => {
                background::terminate(&mut child, grace).await;
                return Err(timeout_error(command, timeout));
            }
        };

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            exit_code: status.code(),
            duration_ms: elapsed_ms(started),
            background: false,
            background_id: None,
        };
        debug!(
            session = %self.inner.id,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "command completed"
        );
        self.record_history(command, &issued_in, &result);
        Ok(result)
    }

    /// Built-in `cd`: never spawns a subprocess.
    fn change_directory(&self, command: &str, target: CdTarget<'_>) -> CommandResult {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let target = match target {
            CdTarget::Home => CdTarget::Home,
            CdTarget::Path(raw) => {
                let raw = strip_quotes(raw);
                if raw.is_empty() {
                    CdTarget::Home
                } else {
                    CdTarget::Path(raw)
                }
            }
        };
        let expanded = match target {
            CdTarget::Home | CdTarget::Path("~") => match home {
                Some(home) => home,
                None => return cd_failure("~", "HOME is not set"),
            },
            CdTarget::Path(raw) => {
                if let Some(rest) = raw.strip_prefix("~/") {
                    match home {
                        Some(home) => home.join(rest),
                        None => return cd_failure(raw, "HOME is not set"),
                    }
                } else {
                    PathBuf::from(raw)
                }
            }
        };

        let issued_in = self.cwd();
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            issued_in.join(expanded)
        };
        let Ok(canonical) = resolved.canonicalize() else {
            return cd_failure(&resolved.display().to_string(), "no such file or directory");
        };
        if !canonical.is_dir() {
            return cd_failure(&canonical.display().to_string(), "not a directory");
        }

        *self.inner.cwd.lock() = canonical.clone();
        debug!(session = %self.inner.id, cwd = %canonical.display(), "working directory changed");

        let result = CommandResult {
            stdout: canonical.display().to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 0,
            background: false,
            background_id: None,
        };
        self.record_history(command, &issued_in, &result);
        result
    }

    fn record_history(&self, command: &str, cwd: &Path, result: &CommandResult) {
        self.inner.history.lock().push(HistoryEntry {
            command: command.to_string(),
            timestamp: Utc::now(),
            cwd: cwd.to_path_buf(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("cwd", &self.cwd())
            .finish_non_exhaustive()
    }
}

/// Parsed form of a built-in `cd` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CdTarget<'a> {
    Home,
    Path(&'a str),
}

fn parse_cd(trimmed: &str) -> Option<CdTarget<'_>> {
    if trimmed == "cd" {
        return Some(CdTarget::Home);
    }
    trimmed.strip_prefix("cd ").map(|rest| {
        let rest = rest.trim();
        if rest.is_empty() {
            CdTarget::Home
        } else {
            CdTarget::Path(rest)
        }
    })
}

fn strip_quotes(raw: &str) -> &str {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if raw.len() >= 2
        && ((bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\''))
    {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

fn cd_failure(path: &str, reason: &str) -> CommandResult {
    CommandResult {
        stdout: String::new(),
        stderr: format!("cd: {path}: {reason}"),
        exit_code: Some(1),
        duration_ms: 0,
        background: false,
        background_id: None,
    }
}

fn spawn_failure(err: &std::io::Error) -> CommandResult {
    CommandResult {
        stdout: String::new(),
        stderr: format!("sh: failed to spawn: {err}"),
        exit_code: Some(127),
        duration_ms: 0,
        background: false,
        background_id: None,
    }
}

fn pipe_failure(stream: &str) -> CommandResult {
    CommandResult {
        stdout: String::new(),
        stderr: format!("sh: {stream} pipe unavailable"),
        exit_code: Some(127),
        duration_ms: 0,
        background: false,
        background_id: None,
    }
}

fn timeout_error(command: &str, timeout: Duration) -> Error {
    Error::Timeout {
        command: command.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("command timed out after {} ms", timeout.as_millis())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_session(cwd: &Path) -> Session {
        Session::new("test", cwd.to_path_buf(), &HashMap::new(), Limits::default())
    }

    #[tokio::test]
    async fn executes_command_and_captures_output() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let result = session
            .execute("echo hello && echo oops >&2", ExecOptions::default())
            .await
            .unwrap();
        assert!(result.stdout.contains("hello"));
        assert!(result.stderr.contains("oops"));
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn captures_nonzero_exit_code() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let result = session
            .execute("exit 42", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(42));
    }

    #[tokio::test]
    async fn cd_changes_cwd_for_later_commands() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let session = test_session(temp.path());

        let result = session.execute("cd sub", ExecOptions::default()).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        let expected = sub.canonicalize().unwrap();
        assert_eq!(result.stdout, expected.display().to_string());

        let pwd = session.execute("pwd", ExecOptions::default()).await.unwrap();
        assert_eq!(pwd.stdout.trim(), expected.display().to_string());
    }

    #[tokio::test]
    async fn cd_to_missing_path_leaves_cwd_unchanged() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());
        let before = session.cwd();

        let result = session
            .execute("cd does-not-exist", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("no such file or directory"));
        assert_eq!(session.cwd(), before);
    }

    #[tokio::test]
    async fn cd_to_file_reports_not_a_directory() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("plain.txt"), "x").unwrap();
        let session = test_session(temp.path());

        let result = session
            .execute("cd plain.txt", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("not a directory"));
    }

    #[tokio::test]
    async fn cd_strips_quotes() {
        let temp = TempDir::new().unwrap();
        let spaced = temp.path().join("has space");
        std::fs::create_dir(&spaced).unwrap();
        let session = test_session(temp.path());

        let result = session
            .execute("cd \"has space\"", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(session.cwd(), spaced.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn cd_expands_tilde() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };

        let result = session.execute("cd ~", ExecOptions::default()).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(
            session.cwd(),
            PathBuf::from(home).canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn timeout_terminates_the_command() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let err = session
            .execute(
                "sleep 5",
                ExecOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn output_cap_is_enforced() {
        let temp = TempDir::new().unwrap();
        let session = Session::new(
            "test",
            temp.path().to_path_buf(),
            &HashMap::new(),
            Limits {
                output_cap_bytes: 1024,
                ..Limits::default()
            },
        );

        let err = session
            .execute(
                "head -c 65536 /dev/zero | tr '\\0' 'x'",
                ExecOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BufferOverflow { limit: 1024 }));
    }

    #[tokio::test]
    async fn session_env_overrides_are_visible() {
        let temp = TempDir::new().unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("CONDUCT_MARKER".to_string(), "present".to_string());
        let session = Session::new(
            "test",
            temp.path().to_path_buf(),
            &overrides,
            Limits::default(),
        );

        let result = session
            .execute("echo \"$CONDUCT_MARKER\"", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "present");
    }

    #[tokio::test]
    async fn history_records_completed_commands() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        session.execute("echo one", ExecOptions::default()).await.unwrap();
        session.execute("echo two", ExecOptions::default()).await.unwrap();

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command, "echo one");
        assert!(history[0].stdout.contains("one"));
        assert_eq!(history[1].command, "echo two");
    }

    #[tokio::test]
    async fn background_command_returns_immediately_and_completes() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let result = session
            .execute(
                "echo started",
                ExecOptions {
                    background: true,
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(result.background);
        assert_eq!(result.exit_code, None);
        let id = result.background_id.unwrap();

        // Poll until the supervisor records completion.
        let mut output = session.background_output(&id).unwrap();
        for _ in 0..100 {
            if output.completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            output = session.background_output(&id).unwrap();
        }
        assert!(output.completed);
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.concat().contains("started"));
    }

    #[tokio::test]
    async fn background_completion_appends_history() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let result = session
            .execute(
                "echo logged",
                ExecOptions {
                    background: true,
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        let id = result.background_id.unwrap();

        for _ in 0..100 {
            if session.background_output(&id).unwrap().completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The supervisor appends the entry at completion time; give the
        // task a moment to run after the state flips.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let history = session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "echo logged");
        assert!(history[0].stdout.contains("logged"));
        assert_eq!(history[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn kill_background_removes_the_record() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let result = session
            .execute(
                "sleep 30",
                ExecOptions {
                    background: true,
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        let id = result.background_id.unwrap();
        assert_eq!(session.list_background().len(), 1);

        assert!(session.kill_background(&id));
        assert!(session.list_background().is_empty());
        assert!(session.background_output(&id).is_err());
    }

    #[tokio::test]
    async fn kill_unknown_background_id_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());
        assert!(!session.kill_background("no-such-id"));
    }

    #[tokio::test]
    async fn streaming_delivers_typed_chunks() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let mut events = Vec::new();
        let result = session
            .execute_streaming(
                "echo out && echo err >&2",
                |event| events.push(event),
                ExecOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        let stdout: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Stdout(data) => Some(data.as_str()),
                _ => None,
            })
            .collect();
        let stderr: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Stderr(data) => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert!(stdout.contains("out"));
        assert!(stderr.contains("err"));
    }

    #[tokio::test]
    async fn streaming_timeout_emits_error_event() {
        let temp = TempDir::new().unwrap();
        let session = test_session(temp.path());

        let mut saw_error = false;
        let result = session
            .execute_streaming(
                "sleep 5",
                |event| {
                    if matches!(event, StreamEvent::Error(_)) {
                        saw_error = true;
                    }
                },
                ExecOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(saw_error);
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn cd_parsing() {
        assert_eq!(parse_cd("cd"), Some(CdTarget::Home));
        assert_eq!(parse_cd("cd /tmp"), Some(CdTarget::Path("/tmp")));
        assert_eq!(parse_cd("cdecho"), None);
        assert_eq!(parse_cd("echo cd"), None);
    }

    #[test]
    fn strip_quotes_handles_both_styles() {
        assert_eq!(strip_quotes("\"a b\""), "a b");
        assert_eq!(strip_quotes("'a b'"), "a b");
        assert_eq!(strip_quotes("plain"), "plain");
        assert_eq!(strip_quotes("\"unbalanced"), "\"unbalanced");
    }
}
