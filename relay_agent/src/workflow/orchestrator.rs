//! Phase-by-phase execution of workflow runs.
//!
//! The [`Orchestrator`] validates a definition, creates a [`WorkflowRun`]
//! and drives it one phase at a time:
//!
//! 1. Tasks of a sequential phase are dispatched one at a time in
//!    declaration order; tasks of a parallel phase are all dispatched as
//!    soon as their dependencies have succeeded.
//! 2. Each task resolves its worker and input, then runs under its retry
//!    policy and per-attempt timeout. Its terminal result is appended to the
//!    run's [`ContextStore`].
//! 3. A fatal task failure fails the phase: no new tasks start, tasks in
//!    flight drain, everything left is recorded as skipped and the run
//!    rolls back.
//! 4. After the last phase the success criteria are evaluated once against
//!    the final context; unmet hard criteria fail the run.
//!
//! Every transition is appended to the run's [`AuditLog`] and published as
//! a [`RunSnapshot`] on a watch channel.

use crate::audit::{AuditEntry, AuditEvent, AuditLog};
use crate::workflow::cancellation::{CancellationToken, CancellationTokenSource};
use crate::workflow::criteria::{evaluate, CriteriaReport, Severity, UnmetCriterion};
use crate::workflow::dag::upstream_tasks;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::error::WorkflowError;
use crate::workflow::phase::{ConcurrencyMode, Phase, PhaseStatus};
use crate::workflow::rollback::{RollbackExecutor, RollbackReport, RollbackScope};
use crate::workflow::state::{FatalError, RunSnapshot, RunStatus};
use crate::workflow::task::TaskDescriptor;
use crate::workflow::template::ResolveScope;
use crate::workflow::validate::WorkflowValidator;
use crate::workflow::worker::{AbortOnDrop, InvocationContext, WorkerInvoker, WorkerRegistry};
use chrono::Utc;
use relay_core::{
    ContextStore, ErrorKind, Payload, PhaseId, RunId, TaskError, TaskId, TaskResult, TaskStatus,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Final result of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub first_error: Option<FatalError>,
    /// Every unmet criterion, hard and soft
    pub unmet_criteria: Vec<UnmetCriterion>,
    /// Present when a rollback ran
    pub rollback: Option<RollbackReport>,
    pub snapshot: RunSnapshot,
}

impl RunOutcome {
    /// Returns true if the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Returns true if the run failed because it was cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.first_error
            .as_ref()
            .is_some_and(|e| e.kind == ErrorKind::Cancelled)
    }
}

enum Readiness {
    Ready,
    /// An upstream task ended without succeeding
    Blocked(TaskId),
    /// An upstream task in the same phase has not finished
    Waiting,
}

fn readiness(context: &ContextStore, task: &TaskDescriptor) -> Readiness {
    let mut waiting = false;
    for dep in upstream_tasks(task) {
        match context.status(&dep) {
            Some(TaskStatus::Succeeded) => {}
            Some(_) => return Readiness::Blocked(dep),
            None => waiting = true,
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// State shared by the control loop and the task units of one run.
#[derive(Clone)]
struct RunShared {
    run_id: RunId,
    definition: Arc<WorkflowDefinition>,
    context: ContextStore,
    args: Arc<Payload>,
    audit: AuditLog,
    invoker: WorkerInvoker,
    cancellation: CancellationToken,
    deadline_hit: Arc<AtomicBool>,
    snapshot: Arc<watch::Sender<RunSnapshot>>,
}

impl RunShared {
    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(entry).await {
            warn!(run_id = %self.run_id, error = %e, "failed to persist audit record");
        }
    }

    fn publish(&self, update: impl FnOnce(&mut RunSnapshot)) {
        self.snapshot.send_modify(|snap| {
            update(snap);
            snap.updated_at = Utc::now();
        });
    }

    fn set_task(&self, task: &TaskId, status: TaskStatus, attempts: Option<u32>) {
        self.publish(|snap| {
            if let Some(summary) = snap.tasks.iter_mut().find(|t| &t.id == task) {
                summary.status = status;
                if let Some(attempts) = attempts {
                    summary.attempts = attempts;
                }
            }
        });
    }

    fn record_result(&self, result: TaskResult) {
        let (task, status) = (result.task_id.clone(), result.status);
        if let Err(e) = self.context.record(result) {
            error!(run_id = %self.run_id, task = %task, error = %e, "context store rejected result");
            return;
        }
        self.set_task(&task, status, None);
    }

    /// Records `task` as skipped unless it already has a terminal result.
    async fn skip_task(&self, phase: &PhaseId, task: &TaskId, reason: &str) {
        if self.context.contains(task) {
            return;
        }
        debug!(run_id = %self.run_id, task = %task, reason, "skipping task");
        self.record_result(TaskResult::skipped(task.clone()));
        self.audit(
            AuditEntry::new(AuditEvent::TaskSkipped)
                .phase(phase)
                .task(task)
                .detail(reason),
        )
        .await;
    }

    fn cancellation_fatal(&self, task: Option<TaskId>) -> FatalError {
        let kind = if self.deadline_hit.load(Ordering::SeqCst) {
            ErrorKind::Timeout
        } else {
            ErrorKind::Cancelled
        };
        FatalError {
            task,
            kind,
            message: self
                .cancellation
                .reason()
                .unwrap_or_else(|| "cancelled".to_string()),
        }
    }

    fn cancelled_fatal(&self) -> Option<FatalError> {
        self.cancellation
            .is_cancelled()
            .then(|| self.cancellation_fatal(None))
    }

    /// Classifies a terminal result; `None` unless it fails the phase.
    fn fatal_error(&self, task: &TaskDescriptor, result: &TaskResult) -> Option<FatalError> {
        if result.status != TaskStatus::Failed {
            return None;
        }
        let error = result.error.as_ref()?;
        if matches!(error, TaskError::Cancelled { .. }) {
            return Some(self.cancellation_fatal(Some(task.id.clone())));
        }
        if task.allow_failure {
            warn!(run_id = %self.run_id, task = %task.id, error = %error, "non-fatal task failed");
            return None;
        }
        Some(FatalError {
            task: Some(task.id.clone()),
            kind: error.kind(),
            message: error.to_string(),
        })
    }

    async fn attempt(
        &self,
        task: &TaskDescriptor,
        attempt: u32,
        timeout: Duration,
    ) -> Result<Payload, TaskError> {
        let worker = task.worker.resolve(&self.context)?;
        let input = {
            let scope = ResolveScope {
                context: &self.context,
                config: &self.definition.config,
                args: &self.args,
            };
            task.input.resolve(&scope)?
        };
        let ctx = InvocationContext {
            run_id: self.run_id,
            task_id: Some(task.id.clone()),
            attempt,
            timeout,
            cancellation: self.cancellation.clone(),
        };
        debug!(worker = %worker, attempt, "invoking worker");
        self.invoker.invoke(&worker, input, ctx).await
    }

    /// Runs one task to a terminal result and records it.
    async fn run_task(self, phase: PhaseId, task: TaskDescriptor) -> TaskResult {
        let config = &self.definition.config;
        let policy = task
            .retry
            .clone()
            .unwrap_or_else(|| config.default_retry_policy());
        let timeout = task.timeout.unwrap_or(config.task_timeout).duration();
        let started_at = Some(Utc::now());

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            self.set_task(&task.id, TaskStatus::Running, Some(attempt));
            self.audit(
                AuditEntry::new(AuditEvent::TaskAttempt {
                    status: TaskStatus::Running,
                })
                .phase(&phase)
                .task(&task.id)
                .attempt(attempt),
            )
            .await;

            let error = match self.attempt(&task, attempt, timeout).await {
                Ok(output) => {
                    self.audit(
                        AuditEntry::new(AuditEvent::TaskAttempt {
                            status: TaskStatus::Succeeded,
                        })
                        .phase(&phase)
                        .task(&task.id)
                        .attempt(attempt),
                    )
                    .await;
                    break TaskResult::succeeded(task.id.clone(), attempt, output, started_at);
                }
                Err(error) => error,
            };

            self.audit(
                AuditEntry::new(AuditEvent::TaskAttempt {
                    status: TaskStatus::Failed,
                })
                .phase(&phase)
                .task(&task.id)
                .attempt(attempt)
                .error(&error),
            )
            .await;

            if self.cancellation.is_cancelled() || !policy.should_retry(attempt, &error) {
                break TaskResult::failed(task.id.clone(), attempt, error, started_at);
            }

            let delay = policy.delay_after(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying task after backoff"
            );
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    let error = TaskError::Cancelled {
                        reason: self
                            .cancellation
                            .reason()
                            .unwrap_or_else(|| "cancelled".to_string()),
                    };
                    break TaskResult::failed(task.id.clone(), attempt, error, started_at);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        match &result.error {
            Some(error) => debug!(attempts = attempt, error = %error, "task failed"),
            None => debug!(attempts = attempt, "task succeeded"),
        }
        self.record_result(result.clone());
        result
    }

    fn task_span(&self, phase: &PhaseId, task: &TaskId) -> tracing::Span {
        info_span!("task", run_id = %self.run_id, phase = %phase, task = %task)
    }

    async fn run_phase(&self, phase: &Phase) -> Option<FatalError> {
        match phase.mode {
            ConcurrencyMode::Sequential => self.run_sequential(phase).await,
            ConcurrencyMode::Parallel => self.run_parallel(phase).await,
        }
    }

    async fn run_sequential(&self, phase: &Phase) -> Option<FatalError> {
        for task in &phase.tasks {
            if let Some(fatal) = self.cancelled_fatal() {
                return Some(fatal);
            }
            match readiness(&self.context, task) {
                Readiness::Ready => {
                    let result = self
                        .clone()
                        .run_task(phase.id.clone(), task.clone())
                        .instrument(self.task_span(&phase.id, &task.id))
                        .await;
                    if let Some(fatal) = self.fatal_error(task, &result) {
                        return Some(fatal);
                    }
                }
                Readiness::Blocked(dep) => {
                    let reason = format!("dependency {dep} did not succeed");
                    self.skip_task(&phase.id, &task.id, &reason).await;
                }
                Readiness::Waiting => {
                    self.skip_task(&phase.id, &task.id, "dependencies not satisfied")
                        .await;
                }
            }
        }
        None
    }

    /// Dispatches every ready task and skips blocked ones until neither
    /// applies to any waiting task.
    async fn dispatch_ready<'p>(
        &self,
        phase: &'p Phase,
        waiting: &mut Vec<&'p TaskDescriptor>,
        in_flight: &mut JoinSet<TaskResult>,
        dispatched: &mut Vec<&'p TaskDescriptor>,
    ) {
        loop {
            let mut skipped = false;
            for task in std::mem::take(waiting) {
                match readiness(&self.context, task) {
                    Readiness::Ready => {
                        let unit = self
                            .clone()
                            .run_task(phase.id.clone(), task.clone())
                            .instrument(self.task_span(&phase.id, &task.id));
                        in_flight.spawn(unit);
                        dispatched.push(task);
                    }
                    Readiness::Blocked(dep) => {
                        let reason = format!("dependency {dep} did not succeed");
                        self.skip_task(&phase.id, &task.id, &reason).await;
                        skipped = true;
                    }
                    Readiness::Waiting => waiting.push(task),
                }
            }
            if !skipped {
                break;
            }
        }
    }

    async fn run_parallel(&self, phase: &Phase) -> Option<FatalError> {
        let mut waiting: Vec<&TaskDescriptor> = phase.tasks.iter().collect();
        let mut dispatched: Vec<&TaskDescriptor> = Vec::new();
        let mut in_flight = JoinSet::new();
        let mut fatal = None;

        loop {
            if fatal.is_none() {
                fatal = self.cancelled_fatal();
            }
            if fatal.is_none() {
                self.dispatch_ready(phase, &mut waiting, &mut in_flight, &mut dispatched)
                    .await;
            }
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok(result) => {
                    if fatal.is_none() {
                        if let Some(task) = phase.tasks.iter().find(|t| t.id == result.task_id) {
                            fatal = self.fatal_error(task, &result);
                        }
                    }
                }
                Err(e) => {
                    error!(run_id = %self.run_id, phase = %phase.id, error = %e, "task unit aborted");
                }
            }
        }

        // A unit that panicked outside the worker call left no result.
        for task in dispatched {
            if self.context.contains(&task.id) {
                continue;
            }
            let error = TaskError::Worker {
                worker: task.worker.to_string(),
                code: Some("panic".to_string()),
                message: "task aborted before recording a result".to_string(),
            };
            let result = TaskResult::failed(task.id.clone(), 1, error, None);
            if fatal.is_none() {
                fatal = self.fatal_error(task, &result);
            }
            self.record_result(result);
        }
        fatal
    }
}

/// One execution of a workflow definition.
///
/// Created by [`Orchestrator::start`] and driven with
/// [`Orchestrator::advance`] or [`Orchestrator::run_to_completion`].
pub struct WorkflowRun {
    shared: RunShared,
    cancel: CancellationTokenSource,
    status: RunStatus,
    next_phase: usize,
    phase_status: Vec<PhaseStatus>,
    first_error: Option<FatalError>,
    criteria: Option<CriteriaReport>,
    rollback: Option<RollbackReport>,
    finished: bool,
    deadline: Option<AbortOnDrop>,
}

impl WorkflowRun {
    pub fn run_id(&self) -> RunId {
        self.shared.run_id
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.shared.definition
    }

    /// Results recorded so far.
    pub fn context(&self) -> &ContextStore {
        &self.shared.context
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.shared.audit
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// True once the run, including any rollback, is over.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn first_error(&self) -> Option<&FatalError> {
        self.first_error.as_ref()
    }

    /// Criteria evaluation, once all phases have passed.
    pub fn criteria_report(&self) -> Option<&CriteriaReport> {
        self.criteria.as_ref()
    }

    pub fn rollback_report(&self) -> Option<&RollbackReport> {
        self.rollback.as_ref()
    }

    /// Current state of the run.
    pub fn snapshot(&self) -> RunSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Receiver that sees a fresh snapshot after every transition.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Handle that cancels this run from elsewhere.
    pub fn canceller(&self) -> CancellationTokenSource {
        self.cancel.clone()
    }

    /// Requests cancellation of every in-flight task.
    ///
    /// # Returns
    ///
    /// `false` if the run was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.cancel.cancel(reason)
    }

    /// Summary of the run in its current state.
    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            run_id: self.run_id(),
            status: self.status,
            first_error: self.first_error.clone(),
            unmet_criteria: self
                .criteria
                .as_ref()
                .map(|report| report.unmet.clone())
                .unwrap_or_default(),
            rollback: self.rollback.clone(),
            snapshot: self.snapshot(),
        }
    }

    async fn set_status(&mut self, status: RunStatus, cause: Option<&FatalError>) {
        if !self.status.can_transition_to(status) {
            error!(
                run_id = %self.shared.run_id,
                from = %self.status,
                to = %status,
                "illegal run status transition"
            );
            return;
        }
        self.status = status;
        info!(run_id = %self.shared.run_id, status = %status, "run status changed");

        let first_error = self.first_error.clone();
        self.shared.publish(|snap| {
            snap.status = status;
            snap.first_error = first_error;
        });

        let mut entry = AuditEntry::new(AuditEvent::RunStatusChanged { status });
        if let Some(cause) = cause {
            entry = entry.error_kind(cause.kind).detail(cause.message.clone());
            if let Some(task) = &cause.task {
                entry = entry.task(task);
            }
        }
        self.shared.audit(entry).await;
    }

    async fn begin_phase(&mut self, index: usize, phase: &Phase) {
        info!(run_id = %self.shared.run_id, phase = %phase.id, tasks = phase.tasks.len(), "phase started");
        self.phase_status[index] = PhaseStatus::Running;
        let id = phase.id.clone();
        self.shared.publish(|snap| {
            snap.current_phase = Some(id);
            if let Some(summary) = snap.phases.get_mut(index) {
                summary.status = PhaseStatus::Running;
            }
        });
        self.shared
            .audit(AuditEntry::new(AuditEvent::PhaseStarted).phase(&phase.id))
            .await;
    }

    async fn finish_phase(&mut self, index: usize, phase: &PhaseId, status: PhaseStatus) {
        self.phase_status[index] = status;
        info!(run_id = %self.shared.run_id, phase = %phase, status = %status, "phase finished");
        self.shared.publish(|snap| {
            if let Some(summary) = snap.phases.get_mut(index) {
                summary.status = status;
            }
        });
        self.shared
            .audit(AuditEntry::new(AuditEvent::PhaseFinished { status }).phase(phase))
            .await;
    }

    /// Gives every task without a result a `Skipped` entry.
    async fn skip_unstarted(&mut self) {
        let definition = Arc::clone(&self.shared.definition);
        for (index, phase) in definition.phases.iter().enumerate() {
            for task in &phase.tasks {
                self.shared
                    .skip_task(&phase.id, &task.id, "run ended before the task started")
                    .await;
            }
            if self.phase_status[index] == PhaseStatus::Pending {
                self.finish_phase(index, &phase.id, PhaseStatus::Skipped)
                    .await;
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.deadline = None;
        self.shared.publish(|snap| {
            snap.finished = true;
            snap.current_phase = None;
        });
        info!(run_id = %self.shared.run_id, status = %self.status, "run finished");
    }
}

/// Drives workflow runs against a set of registered workers.
#[derive(Clone, Default)]
pub struct Orchestrator {
    invoker: WorkerInvoker,
    audit_dir: Option<PathBuf>,
}

impl Orchestrator {
    /// Creates an orchestrator over `registry` with in-memory audit logs.
    pub fn new(registry: WorkerRegistry) -> Self {
        Self::with_invoker(WorkerInvoker::new(registry))
    }

    /// Creates an orchestrator sharing an existing invoker.
    pub fn with_invoker(invoker: WorkerInvoker) -> Self {
        Self {
            invoker,
            audit_dir: None,
        }
    }

    /// Persists each run's audit log under `dir`.
    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    pub fn invoker(&self) -> &WorkerInvoker {
        &self.invoker
    }

    pub fn audit_dir(&self) -> Option<&std::path::Path> {
        self.audit_dir.as_deref()
    }

    /// Validates `definition` and creates a run positioned at its first
    /// phase.
    ///
    /// No task is dispatched until the run is advanced.
    ///
    /// # Returns
    ///
    /// The run, or [`WorkflowError::Validation`] listing every problem.
    pub async fn start(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        args: Payload,
    ) -> Result<WorkflowRun, WorkflowError> {
        let definition = definition.into();
        let report = WorkflowValidator::new()
            .with_workers(self.invoker.registry().ids())
            .validate(&definition);
        for warning in report.warnings() {
            warn!(workflow = %definition.name, "{warning}");
        }
        if !report.is_valid() {
            return Err(WorkflowError::Validation(report));
        }

        let run_id = RunId::new();
        let audit = match &self.audit_dir {
            Some(dir) => AuditLog::with_dir(run_id, dir),
            None => AuditLog::in_memory(run_id),
        };

        let initial = RunSnapshot::for_definition(run_id, &definition);
        let (snapshot, _) = watch::channel(initial);

        let cancel = CancellationTokenSource::new();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline = definition.config.workflow_timeout.map(|timeout| {
            let source = cancel.clone();
            let deadline_hit = Arc::clone(&deadline_hit);
            let duration = timeout.duration();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                deadline_hit.store(true, Ordering::SeqCst);
                let reason = format!("workflow timed out after {}ms", duration.as_millis());
                if source.cancel(reason) {
                    warn!(run_id = %run_id, "workflow timeout elapsed, cancelling run");
                } else {
                    deadline_hit.store(false, Ordering::SeqCst);
                }
            });
            AbortOnDrop(handle.abort_handle())
        });

        let shared = RunShared {
            run_id,
            definition: Arc::clone(&definition),
            context: ContextStore::new(),
            args: Arc::new(args),
            audit,
            invoker: self.invoker.clone(),
            cancellation: cancel.token(),
            deadline_hit,
            snapshot: Arc::new(snapshot),
        };

        info!(
            run_id = %run_id,
            workflow = %definition.name,
            phases = definition.phases.len(),
            tasks = definition.task_count(),
            "workflow run started"
        );
        shared
            .audit(AuditEntry::new(AuditEvent::RunStarted {
                workflow: definition.name.clone(),
                task_count: definition.task_count(),
            }))
            .await;
        shared
            .audit(AuditEntry::new(AuditEvent::RunStatusChanged {
                status: RunStatus::Running,
            }))
            .await;

        Ok(WorkflowRun {
            shared,
            cancel,
            status: RunStatus::Running,
            next_phase: 0,
            phase_status: vec![PhaseStatus::Pending; definition.phases.len()],
            first_error: None,
            criteria: None,
            rollback: None,
            finished: false,
            deadline,
        })
    }

    /// Executes the run's current phase and moves it on.
    ///
    /// After the last phase this also evaluates the success criteria; after
    /// a failure it runs the rollback. Either way the run is finished when
    /// this returns.
    ///
    /// # Returns
    ///
    /// The run status after the step, or [`WorkflowError::AlreadyFinished`].
    pub async fn advance(&self, run: &mut WorkflowRun) -> Result<RunStatus, WorkflowError> {
        if run.finished {
            return Err(WorkflowError::AlreadyFinished(run.run_id()));
        }
        if let Some(fatal) = run.shared.cancelled_fatal() {
            self.fail(run, fatal).await;
            return Ok(run.status);
        }

        let definition = Arc::clone(&run.shared.definition);
        let index = run.next_phase;
        let Some(phase) = definition.phases.get(index) else {
            self.conclude(run).await;
            return Ok(run.status);
        };

        run.begin_phase(index, phase).await;
        let span = info_span!("phase", run_id = %run.shared.run_id, phase = %phase.id);
        let fatal = run.shared.run_phase(phase).instrument(span).await;

        let reason = match &fatal {
            Some(_) => "phase failed before the task started",
            None => "dependencies not satisfied",
        };
        for task in &phase.tasks {
            run.shared.skip_task(&phase.id, &task.id, reason).await;
        }

        let status = if fatal.is_some() {
            PhaseStatus::Failed
        } else if phase
            .tasks
            .iter()
            .all(|t| run.shared.context.is_succeeded(&t.id))
        {
            PhaseStatus::Succeeded
        } else {
            PhaseStatus::Salvaged
        };
        run.finish_phase(index, &phase.id, status).await;
        run.next_phase += 1;

        match fatal {
            Some(fatal) => self.fail(run, fatal).await,
            None if run.next_phase >= definition.phases.len() => self.conclude(run).await,
            None => {}
        }
        Ok(run.status)
    }

    /// Advances `run` until it is finished.
    pub async fn run_to_completion(&self, mut run: WorkflowRun) -> RunOutcome {
        while !run.is_finished() {
            if let Err(e) = self.advance(&mut run).await {
                error!(run_id = %run.run_id(), error = %e, "run stopped advancing");
                break;
            }
        }
        run.outcome()
    }

    /// Starts `definition` and runs it to completion.
    pub async fn execute(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        args: Payload,
    ) -> Result<RunOutcome, WorkflowError> {
        let run = self.start(definition, args).await?;
        Ok(self.run_to_completion(run).await)
    }

    /// Evaluates the success criteria after every phase has passed.
    async fn conclude(&self, run: &mut WorkflowRun) {
        let definition = Arc::clone(&run.shared.definition);
        let report = evaluate(
            &definition.criteria,
            &run.shared.context,
            definition.config.verification_level,
        );

        for unmet in &report.unmet {
            if unmet.severity == Severity::Soft {
                warn!(run_id = %run.shared.run_id, criterion = %unmet.criterion, reason = %unmet.reason, "soft criterion unmet");
            } else {
                info!(run_id = %run.shared.run_id, criterion = %unmet.criterion, reason = %unmet.reason, "criterion unmet");
            }
            run.shared
                .audit(
                    AuditEntry::new(AuditEvent::CriterionUnmet {
                        criterion: unmet.criterion.clone(),
                        severity: unmet.severity,
                    })
                    .error_kind(ErrorKind::CriterionUnmet)
                    .detail(unmet.reason.to_string()),
                )
                .await;
        }
        let unmet = report.unmet.clone();
        run.shared.publish(|snap| snap.unmet_criteria = unmet);

        let hard: Vec<&str> = report
            .hard_unmet()
            .map(|u| u.criterion.as_str())
            .collect();
        let fatal = (!hard.is_empty()).then(|| FatalError {
            task: None,
            kind: ErrorKind::CriterionUnmet,
            message: format!("success criteria not met: {}", hard.join(", ")),
        });
        run.criteria = Some(report);

        match fatal {
            Some(fatal) => self.fail(run, fatal).await,
            None => {
                run.set_status(RunStatus::Succeeded, None).await;
                run.finish();
            }
        }
    }

    /// Fails the run and rolls back what succeeded.
    async fn fail(&self, run: &mut WorkflowRun, fatal: FatalError) {
        warn!(run_id = %run.shared.run_id, error = %fatal, "run failed");
        run.skip_unstarted().await;
        if run.first_error.is_none() {
            run.first_error = Some(fatal.clone());
        }
        run.set_status(RunStatus::Failed, Some(&fatal)).await;

        let definition = Arc::clone(&run.shared.definition);
        if !definition.rollback_plan.is_empty() {
            let executor = RollbackExecutor::new(run.shared.invoker.clone(), definition.config.rollback);
            let report = executor
                .execute(
                    &definition.rollback_plan,
                    RollbackScope {
                        run_id: run.shared.run_id,
                        context: &run.shared.context,
                        config: &definition.config,
                        args: &run.shared.args,
                        audit: &run.shared.audit,
                    },
                )
                .await;
            run.rollback = Some(report);
            run.set_status(RunStatus::RolledBack, None).await;
        }
        run.finish();
    }
}
