//! Workflow definitions.

use crate::workflow::config::WorkflowConfig;
use crate::workflow::criteria::SuccessCriterion;
use crate::workflow::phase::Phase;
use crate::workflow::rollback::CompensationStep;
use crate::workflow::task::TaskDescriptor;
use relay_core::{TaskId, WorkerId};
use std::collections::BTreeSet;

/// Ordered phases plus configuration, success criteria and a rollback plan.
///
/// Phases execute strictly in list order. A definition is immutable once a
/// run has started from it; build one with
/// [`WorkflowBuilder`](crate::workflow::builder::WorkflowBuilder) or load it
/// from YAML with [`load_definition_from_str`](crate::workflow::yaml::load_definition_from_str).
#[derive(Clone, Debug, Default)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: String,
    /// Declared worker catalog; when non-empty every referenced worker must
    /// appear in it
    pub workers: BTreeSet<WorkerId>,
    pub phases: Vec<Phase>,
    pub config: WorkflowConfig,
    pub criteria: Vec<SuccessCriterion>,
    pub rollback_plan: Vec<CompensationStep>,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Every task with the index of its phase, in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = (usize, &TaskDescriptor)> {
        self.phases
            .iter()
            .enumerate()
            .flat_map(|(index, phase)| phase.tasks.iter().map(move |task| (index, task)))
    }

    /// Looks up a task by id.
    pub fn task(&self, id: &TaskId) -> Option<&TaskDescriptor> {
        self.tasks().map(|(_, task)| task).find(|task| &task.id == id)
    }

    /// Index of the phase containing `id`.
    pub fn phase_index_of(&self, id: &TaskId) -> Option<usize> {
        self.tasks()
            .find(|(_, task)| &task.id == id)
            .map(|(index, _)| index)
    }

    /// Total number of tasks.
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    /// Every worker a task or compensation step can invoke.
    pub fn referenced_workers(&self) -> BTreeSet<WorkerId> {
        self.tasks()
            .flat_map(|(_, task)| task.worker.possible_workers())
            .chain(self.rollback_plan.iter().map(|step| step.worker.clone()))
            .collect()
    }
}
