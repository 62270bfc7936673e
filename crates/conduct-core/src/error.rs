//! Fatal error types.
//!
//! Per-call problems (a command exiting non-zero, one batch entry failing)
//! are data, not errors: they travel as structured results or as
//! [`ToolOutput`](crate::outcome::ToolOutput) failure entries. The variants
//! here are the conditions a caller cannot treat as ordinary output.

use thiserror::Error;

use crate::outcome::ToolOutput;
use crate::tasks::TaskStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// Subprocess exceeded its time budget and was terminated.
    #[error("command timed out after {timeout_ms} ms: {command}")]
    Timeout { command: String, timeout_ms: u64 },

    /// Combined stdout/stderr exceeded the configured cap.
    #[error("command output exceeded the {limit}-byte buffer cap")]
    BufferOverflow { limit: usize },

    /// Output read for a background process id that is not registered.
    #[error("unknown background process: {0}")]
    ProcessNotFound(String),

    /// The protected default session cannot be removed.
    #[error("the default session cannot be removed")]
    DefaultSessionProtected,

    /// Removal of a session id that was never created.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A task was added with an id that already exists.
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// A transition was requested for a task id that does not exist.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// A task declared a dependency on an id not known to the manager.
    #[error("task {task} depends on unknown id {dependency}")]
    UnknownDependency { task: String, dependency: String },

    /// The requested status change is not part of the task state machine.
    #[error("task {task}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A dependency-gated batch produced an empty ready set with calls
    /// remaining: a cycle, or an index that can never be satisfied.
    /// Calls that already executed keep their results in `completed`.
    #[error("dependency batch stalled: calls {stuck:?} can never become ready")]
    StalledDependencies {
        stuck: Vec<usize>,
        completed: Vec<(usize, ToolOutput)>,
    },

    /// A chain step produced a failing result; later steps never ran.
    #[error("chain step {step} failed: {message}")]
    ChainFailure { step: usize, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
