//! Tool registry and dispatch.
//!
//! A [`ToolRegistry`] pairs tool definitions with async handlers and
//! implements [`ToolDispatch`], so the batch executors and chains can run
//! against it directly. Handlers receive the shared [`ToolContext`].

pub mod run_command;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::exec::{DispatchFuture, ToolDispatch};
use crate::outcome::ToolOutput;
use crate::session::manager::SessionManager;

/// Machine-readable description of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Async tool handler function.
pub type ToolHandler = Arc<dyn Fn(&ToolContext, Value) -> DispatchFuture + Send + Sync>;

/// Interactive approval capability.
///
/// When `request` resolves to `false`, the calling tool must short-circuit
/// to a cancelled outcome without side effects.
pub trait ApprovalGate: Send + Sync {
    fn request(&self, action: &str, details: &str) -> Pin<Box<dyn Future<Output = bool> + Send>>;
}

/// Context shared by tool handlers.
#[derive(Clone)]
pub struct ToolContext {
    pub sessions: Arc<SessionManager>,
    pub approval: Option<Arc<dyn ApprovalGate>>,
}

impl ToolContext {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            approval: None,
        }
    }

    #[must_use]
    pub fn with_approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// Asks the gate for approval; absent a gate, everything is approved.
    pub(crate) async fn approved(&self, action: &str, details: &str) -> bool {
        match &self.approval {
            Some(gate) => gate.request(action, details).await,
            None => true,
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("has_approval", &self.approval.is_some())
            .finish_non_exhaustive()
    }
}

/// Tool registry (definitions + executors).
#[derive(Clone)]
pub struct ToolRegistry {
    context: ToolContext,
    definitions: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    /// Creates an empty registry over the given context.
    pub fn new(context: ToolContext) -> Self {
        Self {
            context,
            definitions: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in command tools registered.
    pub fn with_builtins(context: ToolContext) -> Self {
        let mut registry = Self::new(context);
        run_command::register_all(&mut registry);
        registry
    }

    /// Registers a tool, replacing any existing tool with the same name.
    /// Lookup is case-insensitive.
    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        let key = definition.name.to_ascii_lowercase();
        if let Some(pos) = self
            .definitions
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(&definition.name))
        {
            self.definitions.remove(pos);
        }
        self.definitions.push(definition);
        self.handlers.insert(key, handler);
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.definitions
            .iter()
            .map(|t| t.name.to_ascii_lowercase())
            .collect()
    }

    /// Executes one tool by name. Unrecognized names produce an
    /// `unknown_tool` failure listing the registered tools.
    pub async fn execute(&self, name: &str, args: Value) -> ToolOutput {
        match self.handlers.get(&name.to_ascii_lowercase()) {
            Some(handler) => handler(&self.context, args).await,
            None => self.unknown_tool(name),
        }
    }

    fn unknown_tool(&self, name: &str) -> ToolOutput {
        let mut available = self.tool_names();
        available.sort();
        ToolOutput::failure(
            "unknown_tool",
            format!("unknown tool: {name} (available: {})", available.join(", ")),
        )
    }
}

impl ToolDispatch for ToolRegistry {
    fn dispatch(&self, name: &str, args: Value) -> DispatchFuture {
        match self.handlers.get(&name.to_ascii_lowercase()) {
            Some(handler) => handler(&self.context, args),
            None => {
                let output = self.unknown_tool(name);
                Box::pin(async move { output })
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("definitions", &self.definitions)
            .field("handlers_len", &self.handlers.len())
            .finish()
    }
}
