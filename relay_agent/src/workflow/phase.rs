//! Phases: ordered groups of tasks.

use crate::workflow::task::TaskDescriptor;
use relay_core::PhaseId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the tasks of a phase are dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// One task at a time, in declaration order
    #[default]
    Sequential,
    /// Every ready task launched at once
    Parallel,
}

/// Lifecycle status of a phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    /// Every task succeeded
    Succeeded,
    /// Only non-fatal tasks failed (or were skipped because of them)
    Salvaged,
    Failed,
    /// Never started because an earlier phase failed
    Skipped,
}

impl PhaseStatus {
    /// Returns true once the phase can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if the run may proceed past this phase.
    pub fn allows_progress(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Salvaged)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Salvaged => "salvaged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Ordered group of tasks that must all be terminal before the run moves on.
#[derive(Clone, Debug)]
pub struct Phase {
    pub id: PhaseId,
    pub mode: ConcurrencyMode,
    pub tasks: Vec<TaskDescriptor>,
}

impl Phase {
    /// Creates an empty phase.
    pub fn new(id: impl Into<PhaseId>, mode: ConcurrencyMode) -> Self {
        Self {
            id: id.into(),
            mode,
            tasks: Vec::new(),
        }
    }

    /// Creates an empty sequential phase.
    pub fn sequential(id: impl Into<PhaseId>) -> Self {
        Self::new(id, ConcurrencyMode::Sequential)
    }

    /// Creates an empty parallel phase.
    pub fn parallel(id: impl Into<PhaseId>) -> Self {
        Self::new(id, ConcurrencyMode::Parallel)
    }

    /// Appends a task.
    pub fn with_task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.push(task);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_constructors() {
        let phase = Phase::parallel("review")
            .with_task(TaskDescriptor::new("a", "w"))
            .with_task(TaskDescriptor::new("b", "w"));
        assert_eq!(phase.mode, ConcurrencyMode::Parallel);
        assert_eq!(phase.tasks.len(), 2);
        assert_eq!(Phase::sequential("x").mode, ConcurrencyMode::Sequential);
    }

    #[test]
    fn test_status_predicates() {
        assert!(!PhaseStatus::Running.is_terminal());
        assert!(PhaseStatus::Skipped.is_terminal());
        assert!(PhaseStatus::Salvaged.allows_progress());
        assert!(!PhaseStatus::Failed.allows_progress());
        assert_eq!(PhaseStatus::Salvaged.to_string(), "salvaged");
    }
}
