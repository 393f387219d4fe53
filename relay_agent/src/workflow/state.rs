//! Run state inspection.
//!
//! A [`RunSnapshot`] is a serializable, point-in-time view of one workflow
//! run for external monitoring. The orchestrator publishes a fresh snapshot
//! after every transition.

use crate::workflow::criteria::UnmetCriterion;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::phase::PhaseStatus;
use chrono::{DateTime, Utc};
use relay_core::{ErrorKind, PhaseId, RunId, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a workflow run.
///
/// `Running -> Succeeded | Failed`, `Failed -> RolledBack`. No transition
/// leaves `Succeeded` or `RolledBack`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    /// Returns true if `next` is a legal successor.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Failed, RunStatus::RolledBack)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// First fatal error of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    /// Originating task; `None` for run-level errors such as unmet criteria
    pub task: Option<TaskId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => write!(f, "[{}] task {}: {}", self.kind, task, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Summary of a phase's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub id: PhaseId,
    pub status: PhaseStatus,
}

/// Summary of a task's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub phase: PhaseId,
    pub status: TaskStatus,
    /// Attempts dispatched so far
    pub attempts: u32,
}

/// Snapshot of a workflow run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    /// True once the run, including any rollback, is over
    pub finished: bool,
    pub current_phase: Option<PhaseId>,
    pub phases: Vec<PhaseSummary>,
    pub tasks: Vec<TaskSummary>,
    pub first_error: Option<FatalError>,
    pub unmet_criteria: Vec<UnmetCriterion>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    /// Initial snapshot of a run: every phase and task pending.
    pub fn for_definition(run_id: RunId, definition: &WorkflowDefinition) -> Self {
        Self {
            run_id,
            workflow: definition.name.clone(),
            status: RunStatus::Running,
            finished: false,
            current_phase: None,
            phases: definition
                .phases
                .iter()
                .map(|phase| PhaseSummary {
                    id: phase.id.clone(),
                    status: PhaseStatus::Pending,
                })
                .collect(),
            tasks: definition
                .phases
                .iter()
                .flat_map(|phase| {
                    phase.tasks.iter().map(|task| TaskSummary {
                        id: task.id.clone(),
                        name: task.name.clone(),
                        phase: phase.id.clone(),
                        status: TaskStatus::Pending,
                        attempts: 0,
                    })
                })
                .collect(),
            first_error: None,
            unmet_criteria: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Fraction of tasks in a terminal state, from 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        let done = self
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .count();
        done as f64 / self.tasks.len() as f64
    }

    /// Status of one task.
    pub fn task_status(&self, task: &TaskId) -> Option<TaskStatus> {
        self.tasks.iter().find(|t| &t.id == task).map(|t| t.status)
    }

    /// Status of one phase.
    pub fn phase_status(&self, phase: &PhaseId) -> Option<PhaseStatus> {
        self.phases.iter().find(|p| &p.id == phase).map(|p| p.status)
    }

    /// Tasks currently dispatched.
    pub fn running_tasks(&self) -> Vec<&TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| &t.id)
            .collect()
    }
}
