//! Task and task-result types.
//!
//! A `TaskSpec` is what callers hand to `submit_task`. The scheduler turns it
//! into a `Task`, owns it until it reaches a terminal state, and produces one
//! `TaskResult` per terminal outcome.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for one submitted task.
///
/// Callers may supply their own; otherwise a UUID v4 string is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Dispatch priority. Higher variants dispatch first.
///
/// Declaration order drives `Ord`: `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        };
        f.write_str(name)
    }
}

/// A request to run one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id. `None` lets the scheduler generate one.
    #[serde(default)]
    pub id: Option<TaskId>,
    /// Discriminant the handler switches on (e.g. "scan:model").
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Opaque to the runtime.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Additional attempts allowed after the first failure.
    #[serde(default)]
    pub max_retries: u32,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            priority: TaskPriority::default(),
            payload: serde_json::Value::Null,
            max_retries: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A task as owned by the scheduler.
///
/// Handlers receive a copy for the duration of one attempt; the scheduler's
/// own bookkeeping copy is never shared with them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    /// Attempts started so far. Never exceeds `max_retries + 1`.
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id.unwrap_or_default(),
            task_type: spec.task_type,
            priority: spec.priority,
            payload: spec.payload,
            max_retries: spec.max_retries,
            attempt_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Total attempts this task may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts()
    }
}

/// The terminal outcome of a task.
///
/// Handlers build one with `success` or `failure`; the scheduler fills in
/// `duration`, `attempts`, and `timestamp` before publishing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    /// Handler output on success.
    pub result: Option<serde_json::Value>,
    /// Failure description on failure.
    pub error: Option<String>,
    /// Wall time of the attempt that produced this result.
    pub duration: Duration,
    /// Attempts made before reaching this outcome.
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: TaskId, result: serde_json::Value) -> Self {
        Self {
            task_id,
            success: true,
            result: Some(result),
            error: None,
            duration: Duration::ZERO,
            attempts: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            result: None,
            error: Some(error.into()),
            duration: Duration::ZERO,
            attempts: 0,
            timestamp: Utc::now(),
        }
    }
}
