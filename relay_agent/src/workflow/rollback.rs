//! Rollback executor using the Saga compensation pattern.
//!
//! When a run fails, the executor walks the workflow's rollback plan and
//! invokes a compensating worker for every step bound to a task that
//! succeeded. Steps run in reverse order of their tasks' completion, so the
//! most recent effect is undone first.
//!
//! Rollback is best-effort and always runs to the end:
//! - a failing or timed-out compensation is logged and the next step runs
//! - run cancellation is not observed; steps get a fresh token
//! - a total time cap bounds the whole rollback; steps not started before
//!   it elapses are reported as abandoned

use crate::audit::{AuditEntry, AuditEvent, AuditLog};
use crate::workflow::cancellation::CancellationToken;
use crate::workflow::config::WorkflowConfig;
use crate::workflow::template::{InputTemplate, ResolveScope};
use crate::workflow::timeout::RollbackTimeout;
use crate::workflow::worker::{InvocationContext, WorkerInvoker};
use relay_core::{ContextStore, Payload, RunId, TaskError, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One entry of a rollback plan.
#[derive(Clone, Debug)]
pub struct CompensationStep {
    /// Step id, unique within the plan
    pub id: String,
    /// Tasks whose effects this step undoes
    pub tasks: Vec<TaskId>,
    /// Worker performing the compensation
    pub worker: WorkerId,
    /// Compensation input; may reference the bound tasks' outputs
    pub input: InputTemplate,
    /// Overrides the configured per-step limit
    pub timeout: Option<Duration>,
}

impl CompensationStep {
    /// Creates a step bound to one task.
    pub fn new(id: impl Into<String>, task: impl Into<TaskId>, worker: impl Into<WorkerId>) -> Self {
        Self {
            id: id.into(),
            tasks: vec![task.into()],
            worker: worker.into(),
            input: InputTemplate::empty(),
            timeout: None,
        }
    }

    /// Binds the step to another task.
    pub fn also_for(mut self, task: impl Into<TaskId>) -> Self {
        self.tasks.push(task.into());
        self
    }

    /// Sets the compensation input.
    pub fn with_input(mut self, input: impl Into<InputTemplate>) -> Self {
        self.input = input.into();
        self
    }

    /// Sets the step timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one compensation step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Completed,
    Failed,
    TimedOut,
    /// Not started before the total rollback cap elapsed
    Abandoned,
}

impl fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Record of one attempted compensation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompensationOutcome {
    pub step: String,
    /// Succeeded tasks the step was applied for
    pub tasks: Vec<TaskId>,
    pub status: CompensationStatus,
    pub error: Option<String>,
}

/// Report of a finished rollback.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Applicable steps, in execution order
    pub outcomes: Vec<CompensationOutcome>,
    /// Steps whose tasks never succeeded
    pub skipped_steps: Vec<String>,
    /// Succeeded tasks no step is bound to
    pub uncovered_tasks: Vec<TaskId>,
}

impl RollbackReport {
    /// Tasks whose compensation completed.
    pub fn compensated_tasks(&self) -> Vec<TaskId> {
        self.outcomes
            .iter()
            .filter(|o| o.status == CompensationStatus::Completed)
            .flat_map(|o| o.tasks.iter().cloned())
            .collect()
    }

    /// Tasks a compensation was attempted for, in execution order.
    pub fn attempted_tasks(&self) -> Vec<TaskId> {
        self.outcomes
            .iter()
            .filter(|o| o.status != CompensationStatus::Abandoned)
            .flat_map(|o| o.tasks.iter().cloned())
            .collect()
    }

    /// Steps that did not complete.
    pub fn failed_steps(&self) -> impl Iterator<Item = &CompensationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status != CompensationStatus::Completed)
    }
}

/// Inputs shared by every step of one rollback.
pub struct RollbackScope<'a> {
    pub run_id: RunId,
    pub context: &'a ContextStore,
    pub config: &'a WorkflowConfig,
    pub args: &'a Payload,
    pub audit: &'a AuditLog,
}

/// Orders applicable steps: latest-completed bound task first, ties broken
/// by reverse plan order.
fn plan_order<'p>(
    plan: &'p [CompensationStep],
    context: &ContextStore,
) -> (Vec<(&'p CompensationStep, Vec<TaskId>)>, Vec<String>) {
    let mut applicable = Vec::new();
    let mut skipped = Vec::new();
    for (index, step) in plan.iter().enumerate() {
        let succeeded: Vec<TaskId> = step
            .tasks
            .iter()
            .filter(|t| context.is_succeeded(t))
            .cloned()
            .collect();
        let latest = succeeded
            .iter()
            .filter_map(|t| context.completion_index(t))
            .max();
        match latest {
            Some(latest) => applicable.push((latest, index, step, succeeded)),
            None => skipped.push(step.id.clone()),
        }
    }
    applicable.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
    (
        applicable
            .into_iter()
            .map(|(_, _, step, tasks)| (step, tasks))
            .collect(),
        skipped,
    )
}

/// Executes rollback plans.
#[derive(Clone)]
pub struct RollbackExecutor {
    invoker: WorkerInvoker,
    limits: RollbackTimeout,
}

impl RollbackExecutor {
    /// Creates an executor.
    pub fn new(invoker: WorkerInvoker, limits: RollbackTimeout) -> Self {
        Self { invoker, limits }
    }

    /// Runs every applicable step of `plan`.
    ///
    /// Never fails: step errors are captured in the report and the audit log.
    pub async fn execute(
        &self,
        plan: &[CompensationStep],
        scope: RollbackScope<'_>,
    ) -> RollbackReport {
        let (ordered, skipped_steps) = plan_order(plan, scope.context);

        let covered: Vec<&TaskId> = plan.iter().flat_map(|s| s.tasks.iter()).collect();
        let uncovered_tasks: Vec<TaskId> = scope
            .context
            .succeeded_in_completion_order()
            .into_iter()
            .filter(|t| !covered.contains(&t))
            .collect();
        if !uncovered_tasks.is_empty() {
            warn!(
                run_id = %scope.run_id,
                tasks = ?uncovered_tasks,
                "succeeded tasks have no compensation step"
            );
        }

        info!(
            run_id = %scope.run_id,
            steps = ordered.len(),
            skipped = skipped_steps.len(),
            "starting rollback"
        );

        let deadline = Instant::now() + self.limits.total;
        let mut outcomes = Vec::with_capacity(ordered.len());
        for (step, tasks) in ordered {
            let outcome = self.run_step(step, tasks, deadline, &scope).await;

            let mut entry = AuditEntry::new(AuditEvent::Compensation {
                step: outcome.step.clone(),
                status: outcome.status,
            });
            if let Some(error) = &outcome.error {
                entry = entry.detail(error.clone());
            }
            if let Err(e) = scope.audit.record(entry).await {
                warn!(run_id = %scope.run_id, error = %e, "failed to persist audit record");
            }
            outcomes.push(outcome);
        }

        RollbackReport {
            outcomes,
            skipped_steps,
            uncovered_tasks,
        }
    }

    async fn run_step(
        &self,
        step: &CompensationStep,
        tasks: Vec<TaskId>,
        deadline: Instant,
        scope: &RollbackScope<'_>,
    ) -> CompensationOutcome {
        let outcome = |status, error| CompensationOutcome {
            step: step.id.clone(),
            tasks: tasks.clone(),
            status,
            error,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(run_id = %scope.run_id, step = %step.id, "rollback cap reached, step abandoned");
            return outcome(CompensationStatus::Abandoned, None);
        }
        let timeout = step.timeout.unwrap_or(self.limits.step).min(remaining);

        let resolve = ResolveScope {
            context: scope.context,
            config: scope.config,
            args: scope.args,
        };
        let input = match step.input.resolve(&resolve) {
            Ok(input) => input,
            Err(e) => {
                warn!(run_id = %scope.run_id, step = %step.id, error = %e, "compensation input unresolved");
                return outcome(CompensationStatus::Failed, Some(e.to_string()));
            }
        };

        debug!(run_id = %scope.run_id, step = %step.id, worker = %step.worker, "invoking compensation");
        let ctx = InvocationContext {
            run_id: scope.run_id,
            task_id: None,
            attempt: 1,
            timeout,
            cancellation: CancellationToken::never(),
        };
        match self.invoker.invoke(&step.worker, input, ctx).await {
            Ok(_) => outcome(CompensationStatus::Completed, None),
            Err(e @ TaskError::Timeout { .. }) => {
                warn!(run_id = %scope.run_id, step = %step.id, error = %e, "compensation timed out");
                outcome(CompensationStatus::TimedOut, Some(e.to_string()))
            }
            Err(e) => {
                warn!(run_id = %scope.run_id, step = %step.id, error = %e, "compensation failed");
                outcome(CompensationStatus::Failed, Some(e.to_string()))
            }
        }
    }
}
