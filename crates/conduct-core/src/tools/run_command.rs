//! Built-in command tools.
//!
//! These bridge tool calls to the session layer: `run_command` executes a
//! shell command in a named session (default session when unnamed), and the
//! `*_process` tools manage that session's background registry. The
//! side-effecting tools (`run_command`, `kill_process`) consult the
//! approval gate before acting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{ToolContext, ToolDefinition, ToolRegistry};
use crate::error::Error;
use crate::outcome::ToolOutput;
use crate::session::ExecOptions;

/// Registers all built-in command tools.
pub fn register_all(registry: &mut ToolRegistry) {
    registry.register(
        run_command_definition(),
        Arc::new(|ctx, args| {
            let ctx = ctx.clone();
            Box::pin(async move { run_command(&ctx, args).await })
        }),
    );
    registry.register(
        list_processes_definition(),
        Arc::new(|ctx, args| {
            let ctx = ctx.clone();
            Box::pin(async move { list_processes(&ctx, &args) })
        }),
    );
    registry.register(
        read_process_output_definition(),
        Arc::new(|ctx, args| {
            let ctx = ctx.clone();
            Box::pin(async move { read_process_output(&ctx, args) })
        }),
    );
    registry.register(
        kill_process_definition(),
        Arc::new(|ctx, args| {
            let ctx = ctx.clone();
            Box::pin(async move { kill_process(&ctx, args).await })
        }),
    );
}

fn run_command_definition() -> ToolDefinition {
    ToolDefinition {
        name: "run_command".to_string(),
        description: "Execute a shell command in a session. The session keeps its working \
            directory between calls; `cd` is handled in-process. Set background=true to \
            launch without waiting and poll the output later."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "session": {
                    "type": "string",
                    "description": "Session id; omit for the default session"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Time budget in milliseconds"
                },
                "background": {
                    "type": "boolean",
                    "description": "Launch without waiting for completion"
                },
                "cwd": {
                    "type": "string",
                    "description": "One-shot working directory override"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        }),
    }
}

fn list_processes_definition() -> ToolDefinition {
    ToolDefinition {
        name: "list_processes".to_string(),
        description: "List a session's background processes with pid, start time, completion \
            status, and exit code."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "session": {
                    "type": "string",
                    "description": "Session id; omit for the default session"
                }
            },
            "additionalProperties": false
        }),
    }
}

fn read_process_output_definition() -> ToolDefinition {
    ToolDefinition {
        name: "read_process_output".to_string(),
        description: "Read the accumulated stdout/stderr of a background process.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "Background process id"
                },
                "session": {
                    "type": "string",
                    "description": "Session id; omit for the default session"
                }
            },
            "required": ["id"],
            "additionalProperties": false
        }),
    }
}

fn kill_process_definition() -> ToolDefinition {
    ToolDefinition {
        name: "kill_process".to_string(),
        description: "Terminate a background process and drop its record. Unknown ids report \
            killed=false rather than failing."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "Background process id"
                },
                "session": {
                    "type": "string",
                    "description": "Session id; omit for the default session"
                }
            },
            "required": ["id"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct RunCommandInput {
    command: String,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    background: bool,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SessionInput {
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessInput {
    id: String,
    #[serde(default)]
    session: Option<String>,
}

async fn run_command(ctx: &ToolContext, args: Value) -> ToolOutput {
    let input: RunCommandInput = match serde_json::from_value(args) {
        Ok(input) => input,
        Err(err) => {
            return ToolOutput::failure("invalid_input", format!("invalid run_command input: {err}"));
        }
    };
    if input.command.trim().is_empty() {
        return ToolOutput::failure("invalid_input", "command cannot be empty");
    }
    if !ctx.approved("run_command", &input.command).await {
        return ToolOutput::cancelled();
    }

    let session = ctx.sessions.session(input.session.as_deref());
    let options = ExecOptions {
        timeout: input.timeout_ms.map(Duration::from_millis),
        background: input.background,
        cwd: input.cwd,
    };
    match session.execute(&input.command, options).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(data) => ToolOutput::success(data),
            Err(err) => ToolOutput::failure("serialize_error", err.to_string()),
        },
        Err(err @ Error::Timeout { .. }) => ToolOutput::failure("timeout", err.to_string()),
        Err(err @ Error::BufferOverflow { .. }) => {
            ToolOutput::failure("buffer_overflow", err.to_string())
        }
        Err(err) => ToolOutput::failure("internal", err.to_string()),
    }
}

fn list_processes(ctx: &ToolContext, args: &Value) -> ToolOutput {
    let input: SessionInput = match serde_json::from_value(args.clone()) {
        Ok(input) => input,
        Err(err) => {
            return ToolOutput::failure(
                "invalid_input",
                format!("invalid list_processes input: {err}"),
            );
        }
    };
    let session = ctx.sessions.session(input.session.as_deref());
    match serde_json::to_value(session.list_background()) {
        Ok(processes) => ToolOutput::success(json!({ "processes": processes })),
        Err(err) => ToolOutput::failure("serialize_error", err.to_string()),
    }
}

fn read_process_output(ctx: &ToolContext, args: Value) -> ToolOutput {
    let input: ProcessInput = match serde_json::from_value(args) {
        Ok(input) => input,
        Err(err) => {
            return ToolOutput::failure(
                "invalid_input",
                format!("invalid read_process_output input: {err}"),
            );
        }
    };
    let session = ctx.sessions.session(input.session.as_deref());
    match session.background_output(&input.id) {
        Ok(output) => match serde_json::to_value(&output) {
            Ok(data) => ToolOutput::success(data),
            Err(err) => ToolOutput::failure("serialize_error", err.to_string()),
        },
        Err(err) => ToolOutput::failure("process_not_found", err.to_string()),
    }
}

async fn kill_process(ctx: &ToolContext, args: Value) -> ToolOutput {
    let input: ProcessInput = match serde_json::from_value(args) {
        Ok(input) => input,
        Err(err) => {
            return ToolOutput::failure("invalid_input", format!("invalid kill_process input: {err}"));
        }
    };
    if !ctx.approved("kill_process", &input.id).await {
        return ToolOutput::cancelled();
    }
    let session = ctx.sessions.session(input.session.as_deref());
    let killed = session.kill_background(&input.id);
    ToolOutput::success(json!({ "id": input.id, "killed": killed }))
}
