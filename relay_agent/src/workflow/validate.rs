//! Workflow validation before execution.
//!
//! Every definition is validated before any of its tasks can start. The
//! validator collects all problems instead of stopping at the first one:
//! structural errors (duplicate or reserved ids, empty phases), reference
//! errors (unknown tasks, workers or configuration fields, malformed
//! templates), ordering errors (dependency cycles, dependencies that can
//! never be satisfied) and invalid policy values.

use crate::workflow::config::WorkflowConfig;
use crate::workflow::dag::DependencyGraph;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::phase::ConcurrencyMode;
use crate::workflow::router::WorkerRef;
use crate::workflow::template::{InputTemplate, Reference, TemplateError, RESERVED_IDS};
use relay_core::{PhaseId, TaskId, WorkerId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// One problem that makes a definition unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow has no phases")]
    EmptyWorkflow,

    #[error("phase {0} has no tasks")]
    EmptyPhase(PhaseId),

    #[error("phase id {0} is declared more than once")]
    DuplicatePhase(PhaseId),

    #[error("task id {0} is declared more than once")]
    DuplicateTask(TaskId),

    #[error("task id {0:?} is invalid (must be non-empty, without dots, braces or whitespace)")]
    InvalidTaskId(String),

    #[error("task id {0} is reserved")]
    ReservedTaskId(TaskId),

    #[error("{owner} references unknown task {reference}")]
    UnknownReference { owner: String, reference: TaskId },

    #[error("task {task} depends on {dependency}, which cannot finish before it starts")]
    ForwardDependency { task: TaskId, dependency: TaskId },

    #[error("task {task} reads {dependency} in the same phase without declaring the dependency")]
    UndeclaredDependency { task: TaskId, dependency: TaskId },

    #[error("{owner} references unknown config field {field}")]
    UnknownConfigField { owner: String, field: String },

    #[error("{owner} has a malformed template: {error}")]
    MalformedTemplate { owner: String, error: TemplateError },

    #[error("{owner} references undefined worker {worker}")]
    UnknownWorker { owner: String, worker: WorkerId },

    #[error("router {router} of task {task} has no candidate workers")]
    EmptyRouter { task: TaskId, router: String },

    #[error("cyclic dependency between tasks {0:?}")]
    CyclicDependency(Vec<TaskId>),

    #[error("criterion {criterion} references unknown task {task}")]
    UnknownCriterionReference { criterion: String, task: TaskId },

    #[error("criterion id {0} is declared more than once")]
    DuplicateCriterion(String),

    #[error("rollback step id {0} is declared more than once")]
    DuplicateRollbackStep(String),

    #[error("rollback step {0} is not bound to any task")]
    EmptyCompensationStep(String),

    #[error("rollback step {step} is bound to unknown task {task}")]
    UnknownRollbackTarget { step: String, task: TaskId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("task {task} has an invalid retry policy: {reason}")]
    InvalidRetryPolicy { task: TaskId, reason: String },

    #[error("{owner} has a zero timeout")]
    InvalidTimeout { owner: String },
}

/// Problem that does not prevent execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Task has no compensation step although the workflow has a rollback plan
    MissingCompensation(TaskId),
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::MissingCompensation(task) => {
                write!(f, "task {task} has no compensation step")
            }
        }
    }
}

/// Validation report for a workflow definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    errors: Vec<ValidationError>,
    warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// Returns whether the definition may be executed.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors, in the order they were found.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Non-fatal findings.
    pub fn warnings(&self) -> &[ValidationWarning] {
        &self.warnings
    }

    /// Cycles found in the dependency graph.
    pub fn cycles(&self) -> Vec<&[TaskId]> {
        self.errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::CyclicDependency(cycle) => Some(cycle.as_slice()),
                _ => None,
            })
            .collect()
    }

    fn error(&mut self, error: ValidationError) {
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join("; "))
    }
}

/// Workflow validator.
///
/// Optionally checks worker references against the set of workers actually
/// registered with the runtime.
#[derive(Clone, Debug, Default)]
pub struct WorkflowValidator {
    registered: Option<BTreeSet<WorkerId>>,
}

fn valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && !id
            .chars()
            .any(|c| c == '.' || c == '{' || c == '}' || c.is_whitespace())
}

impl WorkflowValidator {
    /// Creates a validator that only checks the definition itself.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also require every referenced worker to be in `workers`.
    pub fn with_workers<I>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = WorkerId>,
    {
        self.registered = Some(workers.into_iter().collect());
        self
    }

    /// Validates the definition.
    ///
    /// # Returns
    ///
    /// A report listing every error and warning found.
    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = ValidationReport::default();

        if definition.phases.is_empty() {
            report.error(ValidationError::EmptyWorkflow);
        }

        let mut phase_ids = HashSet::new();
        for phase in &definition.phases {
            if !phase_ids.insert(&phase.id) {
                report.error(ValidationError::DuplicatePhase(phase.id.clone()));
            }
            if phase.tasks.is_empty() {
                report.error(ValidationError::EmptyPhase(phase.id.clone()));
            }
        }

        // id -> (phase index, position in phase)
        let mut positions: HashMap<&TaskId, (usize, usize)> = HashMap::new();
        for (phase_index, phase) in definition.phases.iter().enumerate() {
            for (position, task) in phase.tasks.iter().enumerate() {
                if !valid_task_id(task.id.as_str()) {
                    report.error(ValidationError::InvalidTaskId(task.id.to_string()));
                } else if RESERVED_IDS.contains(&task.id.as_str()) {
                    report.error(ValidationError::ReservedTaskId(task.id.clone()));
                }
                if positions
                    .insert(&task.id, (phase_index, position))
                    .is_some()
                {
                    report.error(ValidationError::DuplicateTask(task.id.clone()));
                }
            }
        }

        for problem in definition.config.problems() {
            report.error(ValidationError::InvalidConfig(problem));
        }

        for (phase_index, phase) in definition.phases.iter().enumerate() {
            for (position, task) in phase.tasks.iter().enumerate() {
                let owner = format!("task {}", task.id);
                let reachable = |dep: &TaskId| -> Result<(usize, usize), ValidationError> {
                    let &(dep_phase, dep_position) =
                        positions
                            .get(dep)
                            .ok_or_else(|| ValidationError::UnknownReference {
                                owner: owner.clone(),
                                reference: dep.clone(),
                            })?;
                    let later_phase = dep_phase > phase_index;
                    let later_in_sequence = dep_phase == phase_index
                        && phase.mode == ConcurrencyMode::Sequential
                        && dep_position > position;
                    if later_phase || later_in_sequence {
                        return Err(ValidationError::ForwardDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                    Ok((dep_phase, dep_position))
                };

                for dep in &task.depends_on {
                    if dep == &task.id {
                        // Reported as a cycle.
                        continue;
                    }
                    if let Err(e) = reachable(dep) {
                        report.error(e);
                    }
                }

                // Inputs the task reads at dispatch time must come from an
                // earlier phase or a declared dependency.
                let mut read_tasks: Vec<TaskId> = Vec::new();
                if let WorkerRef::Routed(router) = &task.worker {
                    if router.candidates().is_empty() {
                        report.error(ValidationError::EmptyRouter {
                            task: task.id.clone(),
                            router: router.name().to_string(),
                        });
                    }
                    read_tasks.extend(router.upstream().cloned());
                }
                read_tasks.extend(self.check_template(&owner, &task.input, &mut report));
                for read in read_tasks {
                    if read == task.id {
                        continue;
                    }
                    match reachable(&read) {
                        Ok((dep_phase, _)) => {
                            if dep_phase == phase_index && !task.depends_on.contains(&read) {
                                report.error(ValidationError::UndeclaredDependency {
                                    task: task.id.clone(),
                                    dependency: read,
                                });
                            }
                        }
                        Err(e) => report.error(e),
                    }
                }

                for worker in task.worker.possible_workers() {
                    self.check_worker(definition, &owner, worker, &mut report);
                }

                if let Some(retry) = &task.retry {
                    if retry.max_attempts == 0 {
                        report.error(ValidationError::InvalidRetryPolicy {
                            task: task.id.clone(),
                            reason: "max_attempts must be at least 1".to_string(),
                        });
                    }
                    if let Err(reason) = retry.backoff.check() {
                        report.error(ValidationError::InvalidRetryPolicy {
                            task: task.id.clone(),
                            reason,
                        });
                    }
                }
                if task.timeout.is_some_and(|t| t.duration().is_zero()) {
                    report.error(ValidationError::InvalidTimeout { owner });
                }
            }
        }

        for cycle in DependencyGraph::from_definition(definition).cycles() {
            report.error(ValidationError::CyclicDependency(cycle));
        }

        let mut criterion_ids = HashSet::new();
        for criterion in &definition.criteria {
            if !criterion_ids.insert(criterion.id.as_str()) {
                report.error(ValidationError::DuplicateCriterion(criterion.id.clone()));
            }
            for task in criterion.predicate.referenced_tasks() {
                if !positions.contains_key(task) {
                    report.error(ValidationError::UnknownCriterionReference {
                        criterion: criterion.id.clone(),
                        task: task.clone(),
                    });
                }
            }
        }

        let mut step_ids = HashSet::new();
        let mut covered = HashSet::new();
        for step in &definition.rollback_plan {
            let owner = format!("rollback step {}", step.id);
            if !step_ids.insert(step.id.as_str()) {
                report.error(ValidationError::DuplicateRollbackStep(step.id.clone()));
            }
            if step.tasks.is_empty() {
                report.error(ValidationError::EmptyCompensationStep(step.id.clone()));
            }
            for task in &step.tasks {
                covered.insert(task);
                if !positions.contains_key(task) {
                    report.error(ValidationError::UnknownRollbackTarget {
                        step: step.id.clone(),
                        task: task.clone(),
                    });
                }
            }
            for read in self.check_template(&owner, &step.input, &mut report) {
                if !positions.contains_key(&read) {
                    report.error(ValidationError::UnknownReference {
                        owner: owner.clone(),
                        reference: read,
                    });
                }
            }
            self.check_worker(definition, &owner, step.worker.clone(), &mut report);
            if step.timeout.is_some_and(|t| t.is_zero()) {
                report.error(ValidationError::InvalidTimeout { owner });
            }
        }

        if !definition.rollback_plan.is_empty() {
            for (_, task) in definition.tasks() {
                if !covered.contains(&task.id) {
                    report
                        .warnings
                        .push(ValidationWarning::MissingCompensation(task.id.clone()));
                }
            }
        }

        report
    }

    /// Checks placeholders, returning the tasks the template reads.
    fn check_template(
        &self,
        owner: &str,
        template: &InputTemplate,
        report: &mut ValidationReport,
    ) -> Vec<TaskId> {
        let references = match template.references() {
            Ok(references) => references,
            Err(error) => {
                report.error(ValidationError::MalformedTemplate {
                    owner: owner.to_string(),
                    error,
                });
                return Vec::new();
            }
        };
        let mut tasks = Vec::new();
        for reference in references {
            match reference {
                Reference::Task { task, .. } => {
                    if !tasks.contains(&task) {
                        tasks.push(task);
                    }
                }
                Reference::Config(field) => {
                    if !WorkflowConfig::is_known_field(&field) {
                        report.error(ValidationError::UnknownConfigField {
                            owner: owner.to_string(),
                            field,
                        });
                    }
                }
                Reference::Args(_) => {}
            }
        }
        tasks
    }

    fn check_worker(
        &self,
        definition: &WorkflowDefinition,
        owner: &str,
        worker: WorkerId,
        report: &mut ValidationReport,
    ) {
        let declared = definition.workers.is_empty() || definition.workers.contains(&worker);
        let registered = self
            .registered
            .as_ref()
            .is_none_or(|registered| registered.contains(&worker));
        if !declared || !registered {
            report.error(ValidationError::UnknownWorker {
                owner: owner.to_string(),
                worker,
            });
        }
    }
}
