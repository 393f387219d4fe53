//! Integration tests for end-to-end workflow runs.
//!
//! These tests drive the orchestrator through whole runs against in-process
//! workers and check run status, context contents, rollback and audit.

use relay_agent::audit::{verify_chain, AuditLog, RunHistory};
use relay_agent::workflow::{
    evaluate, Backoff, CompareOp, CompensationStatus, CompensationStep, FunctionWorker,
    Orchestrator, Phase, PhaseStatus, Predicate, RetryPolicy, Router, RunStatus,
    SuccessCriterion, TaskDescriptor, TaskTimeout, ValidationError, WorkerFailure,
    WorkerRegistry, WorkflowDefinition, WorkflowError,
};
use relay_core::{ErrorKind, Payload, PhaseId, TaskId, TaskStatus};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared record of what workers saw.
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn echo() -> FunctionWorker {
    FunctionWorker::new(|input, _ctx| async move { Ok(input) })
}

fn counting(calls: Arc<AtomicU32>) -> FunctionWorker {
    FunctionWorker::new(move |input, _ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(input) }
    })
}

/// Compensation worker journaling the `undo` field of its input.
fn undo(journal: Journal) -> FunctionWorker {
    FunctionWorker::new(move |input: Payload, _ctx| {
        let journal = journal.clone();
        async move {
            journal.push(input["undo"].as_str().unwrap_or_default());
            Ok(Payload::Null)
        }
    })
}

fn hang() -> FunctionWorker {
    FunctionWorker::new(|input, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(input)
    })
}

fn definition(name: &str, phases: Vec<Phase>) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(name);
    def.phases = phases;
    def
}

fn undo_step(task: &str) -> CompensationStep {
    CompensationStep::new(format!("undo-{task}"), task, "undo").with_input(json!({ "undo": task }))
}

#[tokio::test]
async fn scenario_a_criteria_met() {
    let registry = WorkerRegistry::new().with_worker("echo", echo());
    let mut def = definition(
        "scenario-a",
        vec![Phase::sequential("main")
            .with_task(TaskDescriptor::new("task-1", "echo").with_input(json!({ "step": 1 })))
            .with_task(TaskDescriptor::new("task-2", "echo").with_input(json!({ "step": 2 })))
            .with_task(
                TaskDescriptor::new("task-3", "echo").with_input(json!({ "coverage": 85 })),
            )],
    );
    def.criteria = vec![SuccessCriterion::new(
        "coverage",
        Predicate::compare("task-3", "coverage".parse().unwrap(), CompareOp::Ge, json!(80)),
    )];

    let outcome = Orchestrator::new(registry)
        .execute(def, Payload::Null)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(outcome.first_error.is_none());
    assert!(outcome.unmet_criteria.is_empty());
    assert!(outcome.rollback.is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_timeout_exhausts_retries_and_rolls_back() {
    let journal = Journal::default();
    let calls = Arc::new(AtomicU32::new(0));
    let hang_calls = Arc::clone(&calls);
    let registry = WorkerRegistry::new()
        .with_worker("echo", echo())
        .with_worker(
            "hang",
            FunctionWorker::new(move |input, _ctx| {
                hang_calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(input)
                }
            }),
        )
        .with_worker("undo", undo(journal.clone()));

    let mut def = definition(
        "scenario-b",
        vec![Phase::sequential("main")
            .with_task(TaskDescriptor::new("task-1", "echo"))
            .with_task(
                TaskDescriptor::new("task-2", "hang")
                    .with_timeout(TaskTimeout::from_millis(100))
                    .with_retry(RetryPolicy::new(2).with_backoff(Backoff::None)),
            )
            .with_task(TaskDescriptor::new("task-3", "echo"))],
    );
    def.rollback_plan = vec![undo_step("task-1"), undo_step("task-2"), undo_step("task-3")];

    let orchestrator = Orchestrator::new(registry);
    let run = orchestrator.start(def, Payload::Null).await.unwrap();
    let context = run.context().clone();
    let outcome = orchestrator.run_to_completion(run).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(context.status(&TaskId::new("task-2")), Some(TaskStatus::Failed));
    assert_eq!(context.status(&TaskId::new("task-3")), Some(TaskStatus::Skipped));
    assert_eq!(
        outcome.snapshot.phase_status(&PhaseId::new("main")),
        Some(PhaseStatus::Failed)
    );

    assert_eq!(outcome.status, RunStatus::RolledBack);
    let first = outcome.first_error.unwrap();
    assert_eq!(first.kind, ErrorKind::Timeout);
    assert_eq!(first.task, Some(TaskId::new("task-2")));

    assert_eq!(journal.entries(), vec!["task-1"]);
    let rollback = outcome.rollback.unwrap();
    assert_eq!(rollback.attempted_tasks(), vec![TaskId::new("task-1")]);
    assert_eq!(rollback.skipped_steps, vec!["undo-task-2", "undo-task-3"]);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_no_route_fails_phase_after_siblings_finish() {
    let registry = WorkerRegistry::new()
        .with_worker("echo", echo())
        .with_worker(
            "slow",
            FunctionWorker::new(|input, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(input)
            }),
        );

    let def = definition(
        "scenario-c",
        vec![
            Phase::sequential("detect").with_task(
                TaskDescriptor::new("detect", "echo").with_input(json!({ "language": "cobol" })),
            ),
            Phase::parallel("fix")
                .with_task(TaskDescriptor::new("a", "slow"))
                .with_task(TaskDescriptor::new(
                    "b",
                    Router::matching("by-language", "detect", "language".parse().unwrap())
                        .route(json!("rust"), "echo"),
                )),
        ],
    );

    let outcome = Orchestrator::new(registry)
        .execute(def, Payload::Null)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    let first = outcome.first_error.unwrap();
    assert_eq!(first.kind, ErrorKind::NoRouteMatched);
    assert_eq!(first.task, Some(TaskId::new("b")));

    let snap = &outcome.snapshot;
    assert_eq!(snap.task_status(&TaskId::new("a")), Some(TaskStatus::Succeeded));
    assert_eq!(snap.task_status(&TaskId::new("b")), Some(TaskStatus::Failed));
    let b = snap.tasks.iter().find(|t| t.id.as_str() == "b").unwrap();
    assert_eq!(b.attempts, 1);
    assert_eq!(snap.phase_status(&PhaseId::new("fix")), Some(PhaseStatus::Failed));
}

#[tokio::test]
async fn scenario_d_unknown_criterion_task_rejected_before_dispatch() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkerRegistry::new().with_worker("count", counting(Arc::clone(&calls)));
    let mut def = definition(
        "scenario-d",
        vec![Phase::sequential("main").with_task(TaskDescriptor::new("a", "count"))],
    );
    def.criteria = vec![SuccessCriterion::new(
        "coverage",
        Predicate::compare("ghost", "coverage".parse().unwrap(), CompareOp::Ge, json!(80)),
    )];

    let err = Orchestrator::new(registry)
        .execute(def, Payload::Null)
        .await
        .unwrap_err();

    let report = err.validation_report().unwrap();
    assert!(report
        .errors()
        .contains(&ValidationError::UnknownCriterionReference {
            criterion: "coverage".into(),
            task: TaskId::new("ghost"),
        }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cyclic_definition_never_dispatches() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkerRegistry::new().with_worker("count", counting(Arc::clone(&calls)));
    let def = definition(
        "cycle",
        vec![Phase::parallel("main")
            .with_task(TaskDescriptor::new("a", "count").depends_on("c"))
            .with_task(TaskDescriptor::new("b", "count").depends_on("a"))
            .with_task(TaskDescriptor::new("c", "count").depends_on("b"))],
    );

    let result = Orchestrator::new(registry).start(def, Payload::Null).await;
    match result {
        Err(WorkflowError::Validation(report)) => assert_eq!(report.cycles().len(), 1),
        Err(other) => panic!("expected validation error, got {other}"),
        Ok(_) => panic!("cyclic definition was accepted"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn sequential_phase_starts_in_declaration_order() {
    let journal = Journal::default();
    let worker_journal = journal.clone();
    let registry = WorkerRegistry::new().with_worker(
        "step",
        FunctionWorker::new(move |input, ctx| {
            let journal = worker_journal.clone();
            async move {
                let task = ctx.task_id.map(|t| t.into_inner()).unwrap_or_default();
                journal.push(format!("start:{task}"));
                tokio::time::sleep(Duration::from_millis(10)).await;
                journal.push(format!("end:{task}"));
                Ok(input)
            }
        }),
    );
    let def = definition(
        "ordered",
        vec![Phase::sequential("main")
            .with_task(TaskDescriptor::new("one", "step"))
            .with_task(TaskDescriptor::new("two", "step"))
            .with_task(TaskDescriptor::new("three", "step"))],
    );

    let outcome = Orchestrator::new(registry)
        .execute(def, Payload::Null)
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(
        journal.entries(),
        vec!["start:one", "end:one", "start:two", "end:two", "start:three", "end:three"]
    );
}

#[tokio::test(start_paused = true)]
async fn parallel_phase_dispatches_without_waiting() {
    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let registry = WorkerRegistry::new().with_worker(
        "meet",
        FunctionWorker::new(move |input, _ctx| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                Ok(input)
            }
        }),
    );
    let mut phase = Phase::parallel("fan-out");
    for i in 0..4 {
        phase = phase.with_task(
            TaskDescriptor::new(format!("t{i}"), "meet")
                .with_timeout(TaskTimeout::from_secs(5))
                .with_retry(RetryPolicy::no_retry()),
        );
    }

    let outcome = Orchestrator::new(registry)
        .execute(definition("fan-out", vec![phase]), Payload::Null)
        .await
        .unwrap();

    // Any task waiting on another would time out at the barrier.
    assert!(outcome.is_success(), "{:?}", outcome.first_error);
}

#[tokio::test]
async fn always_failing_worker_is_attempted_exactly_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let worker_calls = Arc::clone(&calls);
    let registry = WorkerRegistry::new().with_worker(
        "broken",
        FunctionWorker::new(move |_input, _ctx| {
            worker_calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(WorkerFailure::with_code("unavailable", "service down")) }
        }),
    );
    let def = definition(
        "retry",
        vec![Phase::sequential("main").with_task(
            TaskDescriptor::new("call", "broken")
                .with_retry(RetryPolicy::new(4).with_backoff(Backoff::None)),
        )],
    );

    let outcome = Orchestrator::new(registry)
        .execute(def, Payload::Null)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.snapshot.tasks[0].attempts, 4);
    assert_eq!(outcome.first_error.unwrap().kind, ErrorKind::Worker);
}

#[tokio::test]
async fn rollback_covers_every_succeeded_task_in_reverse_order() {
    let journal = Journal::default();
    let registry = WorkerRegistry::new()
        .with_worker("echo", echo())
        .with_worker("undo", undo(journal.clone()))
        .with_worker(
            "broken-undo",
            FunctionWorker::new(|_input, _ctx| async move {
                Err(WorkerFailure::new("cannot revert"))
            }),
        )
        .with_worker(
            "broken",
            FunctionWorker::new(|_input, _ctx| async move { Err(WorkerFailure::new("boom")) }),
        );

    let mut def = definition(
        "rollback",
        vec![
            Phase::sequential("first").with_task(TaskDescriptor::new("a", "echo")),
            Phase::parallel("second")
                .with_task(TaskDescriptor::new("b", "echo"))
                .with_task(TaskDescriptor::new("c", "echo")),
            Phase::sequential("third").with_task(
                TaskDescriptor::new("d", "broken").with_retry(RetryPolicy::no_retry()),
            ),
        ],
    );
    def.rollback_plan = vec![
        undo_step("a"),
        CompensationStep::new("undo-b", "b", "broken-undo"),
        undo_step("c"),
        undo_step("d"),
    ];

    let orchestrator = Orchestrator::new(registry);
    let run = orchestrator.start(def, Payload::Null).await.unwrap();
    let context = run.context().clone();
    let outcome = orchestrator.run_to_completion(run).await;

    assert_eq!(outcome.status, RunStatus::RolledBack);
    let rollback = outcome.rollback.unwrap();

    let mut expected = context.succeeded_in_completion_order();
    expected.reverse();
    assert_eq!(expected.len(), 3);
    assert_eq!(rollback.attempted_tasks(), expected);
    assert_eq!(rollback.skipped_steps, vec!["undo-d"]);
    assert_eq!(rollback.failed_steps().count(), 1);
    assert_eq!(journal.entries().last().map(String::as_str), Some("a"));
}

#[tokio::test]
async fn criteria_evaluation_is_idempotent() {
    let registry = WorkerRegistry::new().with_worker("echo", echo());
    let mut def = definition(
        "idempotent",
        vec![Phase::sequential("main")
            .with_task(TaskDescriptor::new("tests", "echo").with_input(json!({ "coverage": 70 })))],
    );
    def.criteria = vec![
        SuccessCriterion::new(
            "coverage",
            Predicate::compare("tests", "coverage".parse().unwrap(), CompareOp::Ge, json!(80)),
        ),
        SuccessCriterion::new(
            "ran",
            Predicate::Succeeded {
                task: TaskId::new("tests"),
            },
        ),
    ];
    let criteria = def.criteria.clone();
    let level = def.config.verification_level;

    let orchestrator = Orchestrator::new(registry);
    let run = orchestrator.start(def, Payload::Null).await.unwrap();
    let context = run.context().clone();
    let outcome = orchestrator.run_to_completion(run).await;
    assert_eq!(outcome.status, RunStatus::Failed);

    let first = evaluate(&criteria, &context, level);
    let second = evaluate(&criteria, &context, level);
    assert_eq!(first, second);
    assert_eq!(first.unmet.len(), 1);
    assert_eq!(outcome.unmet_criteria, first.unmet);
}

#[tokio::test]
async fn persisted_audit_log_replays_run_history() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::default();
    let registry = WorkerRegistry::new()
        .with_worker("echo", echo())
        .with_worker("hang", hang())
        .with_worker("undo", undo(journal));

    let mut def = definition(
        "audited",
        vec![
            Phase::sequential("prepare").with_task(TaskDescriptor::new("prepare", "echo")),
            Phase::sequential("main")
                .with_task(
                    TaskDescriptor::new("stall", "hang")
                        .with_timeout(TaskTimeout::from_millis(50))
                        .with_retry(RetryPolicy::new(2).with_backoff(Backoff::None)),
                )
                .with_task(TaskDescriptor::new("never", "echo")),
        ],
    );
    def.rollback_plan = vec![undo_step("prepare")];

    let outcome = Orchestrator::new(registry)
        .with_audit_dir(dir.path())
        .execute(def, Payload::Null)
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::RolledBack);

    let path = AuditLog::file_path(dir.path(), outcome.run_id);
    let mut records = AuditLog::load(&path).await.unwrap();
    verify_chain(&records).unwrap();

    let history = RunHistory::from_records(&records);
    assert_eq!(history.run_id, Some(outcome.run_id));
    assert_eq!(history.workflow.as_deref(), Some("audited"));
    assert_eq!(
        history.transitions,
        vec![RunStatus::Running, RunStatus::Failed, RunStatus::RolledBack]
    );
    assert_eq!(history.phase_status(&PhaseId::new("main")), Some(PhaseStatus::Failed));

    let stall = history.task(&TaskId::new("stall")).unwrap();
    assert_eq!(stall.status, TaskStatus::Failed);
    assert_eq!(stall.attempts, 2);
    assert_eq!(stall.last_error, Some(ErrorKind::Timeout));
    assert_eq!(
        history.task(&TaskId::new("never")).unwrap().status,
        TaskStatus::Skipped
    );
    assert_eq!(
        history.compensations,
        vec![("undo-prepare".to_string(), CompensationStatus::Completed)]
    );

    records[3].detail = Some("edited".to_string());
    assert!(verify_chain(&records).is_err());
}
