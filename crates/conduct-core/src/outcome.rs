//! Tool-call requests and execution outcomes.
//!
//! Every batch operation in this crate consumes [`ToolCall`]s and produces
//! [`ToolOutput`]s aligned by the original call index. The output envelope
//! serializes to the wire shape consumed by controllers:
//! - success: the data mapping itself
//! - failure: `{"error": "<message>", "code": "<code>"}`
//! - cancelled: `{"cancelled": true}`

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single schedulable tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    /// Indices of calls in the same batch that must execute first.
    ///
    /// Only honored by dependency-gated execution; plain parallel and
    /// sequential runs ignore this field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<usize>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = usize>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }
}

/// Outcome of executing one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    /// The call completed; `data` holds its domain-specific fields.
    Success { data: Value },
    /// The call failed; siblings in a batch are unaffected.
    Failure { code: String, message: String },
    /// An approval collaborator declined the action before it ran.
    Cancelled,
}

impl ToolOutput {
    /// Creates a successful outcome.
    pub fn success(data: Value) -> Self {
        ToolOutput::Success { data }
    }

    /// Creates a failed outcome with a machine-readable code.
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        ToolOutput::Failure {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a cancelled outcome.
    pub fn cancelled() -> Self {
        ToolOutput::Cancelled
    }

    /// Returns true if this outcome represents success.
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    /// Returns true if the action was declined before running.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolOutput::Cancelled)
    }

    /// Returns the data if this is a successful outcome.
    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { data } => Some(data),
            ToolOutput::Failure { .. } | ToolOutput::Cancelled => None,
        }
    }

    /// Returns the error code and message if this is a failure.
    pub fn error_info(&self) -> Option<(&str, &str)> {
        match self {
            ToolOutput::Failure { code, message } => Some((code.as_str(), message.as_str())),
            ToolOutput::Success { .. } | ToolOutput::Cancelled => None,
        }
    }

    /// Converts the outcome to a JSON string for sending to a controller.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":"failed to serialize tool output","code":"serialize_error"}"#.to_string()
        })
    }
}

impl Serialize for ToolOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolOutput::Success { data } => data.serialize(serializer),
            ToolOutput::Failure { code, message } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("error", message)?;
                map.serialize_entry("code", code)?;
                map.end()
            }
            ToolOutput::Cancelled => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("cancelled", &true)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolOutput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        if value.get("cancelled").and_then(Value::as_bool) == Some(true) {
            return Ok(ToolOutput::Cancelled);
        }
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            let code = value
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string();
            return Ok(ToolOutput::Failure {
                code,
                message: message.to_string(),
            });
        }
        Ok(ToolOutput::Success { data: value })
    }
}
