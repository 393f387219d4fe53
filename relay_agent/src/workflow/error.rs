use crate::workflow::validate::ValidationReport;
use relay_core::RunId;
use thiserror::Error;

/// Error types for workflow operations.
///
/// Task-level failures never surface here; they are absorbed into the run's
/// status and first error.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Definition rejected before any task was dispatched
    #[error("Workflow validation failed: {0}")]
    Validation(ValidationReport),

    /// Run already reached a terminal state
    #[error("Run {0} has already finished")]
    AlreadyFinished(RunId),
}

impl WorkflowError {
    /// Validation report, if this is a validation error.
    pub fn validation_report(&self) -> Option<&ValidationReport> {
        match self {
            WorkflowError::Validation(report) => Some(report),
            WorkflowError::AlreadyFinished(_) => None,
        }
    }
}

impl From<ValidationReport> for WorkflowError {
    fn from(report: ValidationReport) -> Self {
        WorkflowError::Validation(report)
    }
}
