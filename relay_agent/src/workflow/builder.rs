//! Fluent builder API for workflow construction.
//!
//! Provides a chainable API for assembling a [`WorkflowDefinition`] from
//! phases, success criteria and compensation steps. The result is validated
//! on [`build`](WorkflowBuilder::build).

use crate::workflow::config::WorkflowConfig;
use crate::workflow::criteria::SuccessCriterion;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::error::WorkflowError;
use crate::workflow::phase::Phase;
use crate::workflow::rollback::CompensationStep;
use crate::workflow::validate::WorkflowValidator;
use relay_core::WorkerId;
use tracing::warn;

/// Fluent builder for workflow definitions.
///
/// # Example
///
/// ```ignore
/// use relay_agent::workflow::{Phase, TaskDescriptor, WorkflowBuilder};
///
/// let definition = WorkflowBuilder::new("release")
///     .phase(Phase::sequential("build").with_task(TaskDescriptor::new("compile", "cc")))
///     .phase(
///         Phase::parallel("verify")
///             .with_task(TaskDescriptor::new("test", "runner").depends_on("compile"))
///             .with_task(TaskDescriptor::new("lint", "linter")),
///     )
///     .build()?;
/// ```
#[derive(Clone, Debug)]
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowBuilder {
    /// Creates a builder for a workflow called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: WorkflowDefinition::new(name),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = description.into();
        self
    }

    /// Declares a worker in the catalog.
    ///
    /// Once any worker is declared, every task and compensation step must
    /// use a declared worker.
    pub fn worker(mut self, worker: impl Into<WorkerId>) -> Self {
        self.definition.workers.insert(worker.into());
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.definition.config = config;
        self
    }

    /// Appends a phase; phases run in the order they are added.
    pub fn phase(mut self, phase: Phase) -> Self {
        self.definition.phases.push(phase);
        self
    }

    pub fn criterion(mut self, criterion: SuccessCriterion) -> Self {
        self.definition.criteria.push(criterion);
        self
    }

    /// Appends a step to the rollback plan.
    pub fn compensation(mut self, step: CompensationStep) -> Self {
        self.definition.rollback_plan.push(step);
        self
    }

    /// Builds the definition.
    ///
    /// # Returns
    ///
    /// - `Ok(WorkflowDefinition)` - If the definition is valid
    /// - `Err(WorkflowError::Validation)` - Every problem found
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        let report = WorkflowValidator::new().validate(&self.definition);
        for warning in report.warnings() {
            warn!(workflow = %self.definition.name, "{warning}");
        }
        if !report.is_valid() {
            return Err(WorkflowError::Validation(report));
        }
        Ok(self.definition)
    }
}
