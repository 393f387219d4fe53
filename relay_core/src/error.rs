//! Error types for RelayKit.

use crate::types::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of every failure the engine reports.
///
/// Used in audit records and in the run's first-error summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Workflow definition was rejected before execution
    Validation,
    /// Input template referenced something that does not resolve
    UnresolvedReference,
    /// Task attempt exceeded its timeout
    Timeout,
    /// Worker reported an error
    Worker,
    /// Router had no candidate for the observed context
    NoRouteMatched,
    /// A hard success criterion was unmet
    CriterionUnmet,
    /// Run was cancelled
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::UnresolvedReference => "unresolved_reference",
            Self::Timeout => "timeout",
            Self::Worker => "worker",
            Self::NoRouteMatched => "no_route_matched",
            Self::CriterionUnmet => "criterion_unmet",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure of a single task attempt.
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// Input template could not be resolved against the context
    #[error("unresolved reference: {reference}")]
    UnresolvedReference { reference: String },

    /// Attempt exceeded its timeout
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Worker reported an error
    #[error("worker {worker} failed: {message}")]
    Worker {
        worker: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },

    /// Router could not pick a worker
    #[error("router {router} matched no route: {detail}")]
    NoRouteMatched { router: String, detail: String },

    /// Attempt was abandoned because the run was cancelled
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl TaskError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnresolvedReference { .. } => ErrorKind::UnresolvedReference,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Worker { .. } => ErrorKind::Worker,
            Self::NoRouteMatched { .. } => ErrorKind::NoRouteMatched,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns the worker-supplied error code, if any.
    pub fn worker_code(&self) -> Option<&str> {
        match self {
            Self::Worker { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Errors from recording into the context store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The task already has a final result
    #[error("task {0} already has a recorded result")]
    AlreadyRecorded(TaskId),

    /// Only terminal results may be recorded
    #[error("task {task} result has non-terminal status {status}")]
    NotTerminal { task: TaskId, status: TaskStatus },
}

/// Errors from reading values out of the context store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// No result recorded for the task
    #[error("no result recorded for task {0}")]
    MissingTask(TaskId),

    /// Task has a result but no output (failed or skipped)
    #[error("task {task} has no output (status {status})")]
    NoOutput { task: TaskId, status: TaskStatus },

    /// Output does not contain the requested field
    #[error("task {task} output has no field {path}")]
    MissingField { task: TaskId, path: String },
}
