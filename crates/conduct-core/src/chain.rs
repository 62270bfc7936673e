//! Sequential tool-call composition.
//!
//! A [`ToolChain`] always runs its steps in the order they were added; the
//! per-step `dependencies` field is descriptive metadata for controllers,
//! not a scheduling input. A step with a false condition is skipped without
//! leaving a result; any failing result aborts the chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec::ToolDispatch;
use crate::outcome::ToolOutput;

/// Results of completed steps, keyed by step index. Skipped steps have no
/// entry.
pub type ChainResults = BTreeMap<usize, ToolOutput>;

type StepCondition = Box<dyn Fn(&ChainResults) -> bool + Send>;
type StepCallback = Box<dyn FnMut(&ToolOutput, &ChainResults) + Send>;

/// One step in a chain.
pub struct ChainStep {
    pub name: String,
    pub args: Value,
    /// Descriptive only; execution order is add-order.
    pub dependencies: Vec<usize>,
    condition: Option<StepCondition>,
    callback: Option<StepCallback>,
}

impl ChainStep {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            dependencies: Vec::new(),
            condition: None,
            callback: None,
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = usize>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    /// Skips the step when the condition evaluates false against the
    /// results gathered so far.
    #[must_use]
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ChainResults) -> bool + Send + 'static,
    {
        self.condition = Some(Box::new(condition));
        self
    }

    /// Invoked with the step's output and the results gathered so far.
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&ToolOutput, &ChainResults) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("has_condition", &self.condition.is_some())
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Ordered composition of tool calls with fail-fast semantics.
pub struct ToolChain {
    dispatch: Arc<dyn ToolDispatch>,
    steps: Vec<ChainStep>,
}

impl ToolChain {
    pub fn new(dispatch: Arc<dyn ToolDispatch>) -> Self {
        Self {
            dispatch,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn add(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the chain to completion or first failure.
    ///
    /// # Errors
    /// Returns [`Error::ChainFailure`] naming the failing step index and
    /// message; steps after the failing one never run.
    pub async fn run(self) -> Result<ChainResults> {
        let dispatch = self.dispatch;
        let mut results = ChainResults::new();

        for (index, mut step) in self.steps.into_iter().enumerate() {
            if let Some(condition) = &step.condition {
                if !condition(&results) {
                    debug!(index, name = %step.name, "chain step skipped");
                    continue;
                }
            }

            let output = dispatch.dispatch(&step.name, step.args).await;
            if !output.is_ok() {
                let message = match output.error_info() {
                    Some((_, message)) => message.to_string(),
                    None => "cancelled".to_string(),
                };
                return Err(Error::ChainFailure {
                    step: index,
                    message,
                });
            }

            results.insert(index, output);
            if let Some(callback) = step.callback.as_mut() {
                let stored = &results[&index];
                callback(stored, &results);
            }
        }

        Ok(results)
    }
}

impl std::fmt::Debug for ToolChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolChain")
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}
