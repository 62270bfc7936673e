//! Task bookkeeping for multi-step plans.
//!
//! A [`TaskManager`] is pure bookkeeping: it never executes anything. A
//! planner adds tasks with optional dependencies, walks them through the
//! status machine, and asks for the next executable one. Dependencies
//! reference task ids; cycle detection for executable batches lives in
//! [`exec`](crate::exec), not here.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Status machine:
/// `pending -> in_progress -> completed | failed`, `pending -> blocked`,
/// and `blocked -> pending` via an explicit unblock only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Completed and failed tasks never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trackable unit of planned work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    /// Display label while the task is running ("Running tests").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Options for [`TaskManager::add_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Explicit id; generated monotonically when absent.
    pub id: Option<String>,
    pub active_form: Option<String>,
    pub dependencies: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// Per-status counts plus an overall completion percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub percentage: u8,
}

/// Insertion-ordered collection of tasks with unique ids.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    next_id: u64,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task and returns its id.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateTaskId`] when the explicit id already
    /// exists, and [`Error::UnknownDependency`] when a dependency names an
    /// id that has not been added yet — forward references are rejected so
    /// a task can never wait on an id that will never complete.
    pub fn add_task(&mut self, description: impl Into<String>, options: TaskOptions) -> Result<String> {
        let id = match options.id {
            Some(id) => {
                if self.index.contains_key(&id) {
                    return Err(Error::DuplicateTaskId(id));
                }
                id
            }
            None => self.generate_id(),
        };
        for dependency in &options.dependencies {
            if !self.index.contains_key(dependency) {
                return Err(Error::UnknownDependency {
                    task: id,
                    dependency: dependency.clone(),
                });
            }
        }

        debug!(task = %id, "task added");
        self.index.insert(id.clone(), self.tasks.len());
        self.tasks.push(Task {
            id: id.clone(),
            description: description.into(),
            active_form: options.active_form,
            status: TaskStatus::Pending,
            dependencies: options.dependencies,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            metadata: options.metadata,
        });
        Ok(id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Removes every task. Individual removal is deliberately unsupported;
    /// ids stay stable for the lifetime of a plan.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.index.clear();
    }

    /// `pending -> in_progress`, stamping the start time.
    ///
    /// # Errors
    /// Returns [`Error::UnknownTask`] or [`Error::InvalidTransition`].
    pub fn start_task(&mut self, id: &str) -> Result<()> {
        let task = self.task_mut(id, TaskStatus::InProgress, TaskStatus::Pending)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// `in_progress -> completed`, recording an optional result value.
    ///
    /// # Errors
    /// Returns [`Error::UnknownTask`] or [`Error::InvalidTransition`].
    pub fn complete_task(&mut self, id: &str, result: Option<Value>) -> Result<()> {
        let task = self.task_mut(id, TaskStatus::Completed, TaskStatus::InProgress)?;
        task.status = TaskStatus::Completed;
        task.result = result;
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `in_progress -> failed`, recording the error message.
    ///
    /// # Errors
    /// Returns [`Error::UnknownTask`] or [`Error::InvalidTransition`].
    pub fn fail_task(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        let task = self.task_mut(id, TaskStatus::Failed, TaskStatus::InProgress)?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.into());
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `pending -> blocked`.
    ///
    /// # Errors
    /// Returns [`Error::UnknownTask`] or [`Error::InvalidTransition`].
    pub fn block_task(&mut self, id: &str) -> Result<()> {
        let task = self.task_mut(id, TaskStatus::Blocked, TaskStatus::Pending)?;
        task.status = TaskStatus::Blocked;
        Ok(())
    }

    /// `blocked -> pending`. Nothing unblocks a task implicitly.
    ///
    /// # Errors
    /// Returns [`Error::UnknownTask`] or [`Error::InvalidTransition`].
    pub fn unblock_task(&mut self, id: &str) -> Result<()> {
        let task = self.task_mut(id, TaskStatus::Pending, TaskStatus::Blocked)?;
        task.status = TaskStatus::Pending;
        Ok(())
    }

    /// True when the task is pending and every dependency has completed.
    pub fn can_execute(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task.dependencies.iter().all(|dep| {
                self.task(dep)
                    .is_some_and(|t| t.status == TaskStatus::Completed)
            })
    }

    /// First executable task in insertion order, for sequential planners.
    pub fn next_executable(&self) -> Option<&Task> {
        self.tasks.iter().find(|task| self.can_execute(task))
    }

    /// Per-status counts; `percentage` is 0 for an empty plan.
    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.tasks.len(),
            pending: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            blocked: 0,
            percentage: 0,
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Blocked => progress.blocked += 1,
            }
        }
        if progress.total > 0 {
            let ratio = progress.completed as f64 / progress.total as f64;
            progress.percentage = (ratio * 100.0).round() as u8;
        }
        progress
    }

    fn generate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("task-{}", self.next_id);
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    fn task_mut(&mut self, id: &str, to: TaskStatus, expected: TaskStatus) -> Result<&mut Task> {
        let index = *self
            .index
            .get(id)
            .ok_or_else(|| Error::UnknownTask(id.to_string()))?;
        let task = &mut self.tasks[index];
        if task.status != expected {
            return Err(Error::InvalidTransition {
                task: id.to_string(),
                from: task.status,
                to,
            });
        }
        Ok(task)
    }
}
