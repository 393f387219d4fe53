//! Process exit codes of the control surface.

use crate::RuntimeError;
use relay_agent::workflow::{RunStatus, YamlWorkflowError};
use relay_agent::RunOutcome;
use relay_agent::WorkflowError;
use std::fmt;

/// Exit code reported by the `relay` binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Run succeeded, or the command completed
    Success = 0,
    /// Bad usage, unreadable input or an internal error
    Usage = 1,
    /// Definition rejected before any task started
    Validation = 2,
    /// Run failed, with or without rollback
    Failed = 3,
    /// Run was cancelled
    Cancelled = 4,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps a finished run to its exit status.
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        match outcome.status {
            RunStatus::Succeeded => ExitStatus::Success,
            _ if outcome.was_cancelled() => ExitStatus::Cancelled,
            _ => ExitStatus::Failed,
        }
    }

    /// Maps an error from the runtime to its exit status.
    pub fn from_error(error: &RuntimeError) -> Self {
        match error {
            RuntimeError::Workflow(WorkflowError::Validation(_)) => ExitStatus::Validation,
            RuntimeError::Definition { source, .. } => match source {
                YamlWorkflowError::Io(_) => ExitStatus::Usage,
                _ => ExitStatus::Validation,
            },
            _ => ExitStatus::Usage,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStatus::Success => "success",
            ExitStatus::Usage => "usage error",
            ExitStatus::Validation => "validation error",
            ExitStatus::Failed => "runtime failure",
            ExitStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status as u8)
    }
}
