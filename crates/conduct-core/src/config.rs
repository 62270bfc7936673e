//! Runtime limits configuration.
//!
//! Loads from a TOML file with sensible defaults; a missing file yields the
//! defaults unchanged, so embedding callers can skip configuration entirely.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Execution limits shared by sessions and batch executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Per-command time budget in milliseconds.
    pub command_timeout_ms: u64,
    /// Combined stdout+stderr cap in bytes for foreground commands.
    pub output_cap_bytes: usize,
    /// Maximum number of tool calls in flight during parallel batches.
    pub parallel_calls: usize,
    /// Grace period in milliseconds between the initial termination signal
    /// and the forced kill when a command must be stopped.
    pub kill_grace_ms: u64,
}

impl Limits {
    pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 120_000;
    pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 10 * 1024 * 1024;
    pub const DEFAULT_PARALLEL_CALLS: usize = 5;
    pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;

    /// Returns the command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Returns the kill grace period as a [`Duration`].
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Loads limits from a TOML file, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read limits from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse limits from {}", path.display()))
        } else {
            Ok(Limits::default())
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            command_timeout_ms: Self::DEFAULT_COMMAND_TIMEOUT_MS,
            output_cap_bytes: Self::DEFAULT_OUTPUT_CAP_BYTES,
            parallel_calls: Self::DEFAULT_PARALLEL_CALLS,
            kill_grace_ms: Self::DEFAULT_KILL_GRACE_MS,
        }
    }
}
