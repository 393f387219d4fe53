//! Core types for RelayKit.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Structured payload exchanged with workers and stored in the context.
pub type Payload = serde_json::Value;

/// Declares a string-backed identifier with the usual conversions.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the underlying string identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier and returns the underlying string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<&$name> for $name {
            fn from(id: &$name) -> Self {
                id.clone()
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of a task, unique within one workflow definition.
    TaskId
}

string_id! {
    /// Identifier of a phase, unique within one workflow definition.
    PhaseId
}

string_id! {
    /// Identifier of an external worker (an agent) that executes tasks.
    WorkerId
}

/// Unique identifier of one workflow run.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a fresh random run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task has not been dispatched yet
    Pending,
    /// Task has been dispatched to a worker
    Running,
    /// Task produced an output
    Succeeded,
    /// Task failed after exhausting its retry policy
    Failed,
    /// Task was never executed
    Skipped,
}

impl TaskStatus {
    /// Returns true for Succeeded, Failed and Skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one task attempt.
///
/// Every attempt produces a `TaskResult`; only the final one is kept in the
/// [`ContextStore`](crate::ContextStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task that produced this result
    pub task_id: TaskId,
    /// Attempt number, starting at 1 (0 for tasks that never ran)
    pub attempt: u32,
    /// Status reached by this attempt
    pub status: TaskStatus,
    /// Worker output, present only when Succeeded
    pub output: Option<Payload>,
    /// Error, present only when Failed
    pub error: Option<TaskError>,
    /// When the attempt was dispatched
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt reached its status
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// Creates a successful result finished now.
    pub fn succeeded(
        task_id: impl Into<TaskId>,
        attempt: u32,
        output: Payload,
        started_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            status: TaskStatus::Succeeded,
            output: Some(output),
            error: None,
            started_at,
            finished_at: Some(Utc::now()),
        }
    }

    /// Creates a failed result finished now.
    pub fn failed(
        task_id: impl Into<TaskId>,
        attempt: u32,
        error: TaskError,
        started_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error),
            started_at,
            finished_at: Some(Utc::now()),
        }
    }

    /// Creates a result for a task that never ran.
    pub fn skipped(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt: 0,
            status: TaskStatus::Skipped,
            output: None,
            error: None,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    /// Returns true if the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_id_display_and_borrow() {
        let id = TaskId::new("build");
        assert_eq!(id.to_string(), "build");

        let mut map = std::collections::HashMap::new();
        map.insert(id.clone(), 1);
        assert_eq!(map.get("build"), Some(&1));
    }

    #[test]
    fn test_run_id_round_trips_through_str() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_result_constructors() {
        let ok = TaskResult::succeeded("a", 2, json!({"x": 1}), None);
        assert!(ok.is_success());
        assert_eq!(ok.attempt, 2);
        assert!(ok.error.is_none());

        let failed = TaskResult::failed(
            "b",
            3,
            TaskError::Timeout { timeout_ms: 10 },
            Some(Utc::now()),
        );
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.output.is_none());

        let skipped = TaskResult::skipped("c");
        assert_eq!(skipped.attempt, 0);
        assert!(skipped.started_at.is_none());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
    }
}
