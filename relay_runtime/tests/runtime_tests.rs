//! Integration tests for the runtime control surface.
//!
//! Runs are hosted by a [`Runtime`] over in-process workers, with workflow
//! definitions and audit files in a temporary directory.

use relay_agent::audit::verify_chain;
use relay_agent::workflow::{FunctionWorker, RunStatus, WorkerRegistry};
use relay_core::{ErrorKind, Payload, RunId, TaskId, TaskStatus};
use relay_runtime::{ExitStatus, MetricKind, Runtime, RuntimeConfig, RuntimeError};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const RELEASE: &str = r#"
name: release
workers: [builder, publisher, unpublisher]
phases:
  - id: build
    tasks:
      - id: build
        worker: builder
        input: { version: "{{args.version}}" }
  - id: publish
    tasks:
      - id: publish
        worker: publisher
        input: "{{build.artifact}}"
criteria:
  - id: published
    task: publish
rollback:
  - id: unpublish
    tasks: [publish]
    worker: unpublisher
"#;

const LINT: &str = r#"
name: lint
phases:
  - id: lint
    tasks:
      - id: lint
        worker: builder
"#;

fn registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .with_worker(
            "builder",
            FunctionWorker::new(|input: Payload, _ctx| async move {
                Ok(json!({ "artifact": { "name": "relay", "version": input["version"] } }))
            }),
        )
        .with_worker(
            "publisher",
            FunctionWorker::new(|input, _ctx| async move { Ok(input) }),
        )
        .with_worker(
            "unpublisher",
            FunctionWorker::new(|_input, _ctx| async move { Ok(Payload::Null) }),
        )
}

fn config(root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        workflows_dir: root.join("workflows"),
        audit_dir: root.join("audit"),
        ..Default::default()
    }
}

fn write_workflows(root: &Path) {
    let dir = root.join("workflows");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("release.yaml"), RELEASE).unwrap();
    std::fs::write(dir.join("lint.yml"), LINT).unwrap();
    std::fs::write(dir.join("README.md"), "not a workflow").unwrap();
}

#[tokio::test]
async fn test_load_workflows_dir() {
    let root = tempfile::tempdir().unwrap();
    write_workflows(root.path());

    let runtime = Runtime::with_registry(config(root.path()), registry());
    assert_eq!(runtime.load_workflows_dir().await.unwrap(), 2);
    assert_eq!(runtime.workflows(), vec!["lint", "release"]);
}

#[tokio::test]
async fn test_missing_workflows_dir_registers_nothing() {
    let root = tempfile::tempdir().unwrap();
    let runtime = Runtime::with_registry(config(root.path()), registry());
    assert_eq!(runtime.load_workflows_dir().await.unwrap(), 0);
    assert!(runtime.workflows().is_empty());
}

#[tokio::test]
async fn test_duplicate_workflow_rejected() {
    let root = tempfile::tempdir().unwrap();
    write_workflows(root.path());
    let runtime = Runtime::with_registry(config(root.path()), registry());
    runtime.load_workflows_dir().await.unwrap();

    let err = runtime
        .register_file(root.path().join("workflows/lint.yml"))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateWorkflow(name) if name == "lint"));
}

#[tokio::test]
async fn test_unregistered_worker_is_validation_error() {
    let root = tempfile::tempdir().unwrap();
    write_workflows(root.path());
    let runtime = Runtime::with_registry(
        config(root.path()),
        WorkerRegistry::new().with_worker(
            "builder",
            FunctionWorker::new(|input, _ctx| async move { Ok(input) }),
        ),
    );

    let err = runtime
        .register_file(root.path().join("workflows/release.yaml"))
        .await
        .unwrap_err();
    assert_eq!(ExitStatus::from_error(&err), ExitStatus::Validation);
    assert!(err.to_string().contains("publisher"));
}

#[tokio::test]
async fn test_run_to_success() {
    let root = tempfile::tempdir().unwrap();
    write_workflows(root.path());
    let runtime = Runtime::with_registry(config(root.path()), registry());
    runtime.load_workflows_dir().await.unwrap();

    let outcome = runtime
        .run("release", json!({ "version": "1.2.0" }))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(ExitStatus::from_outcome(&outcome), ExitStatus::Success);

    assert!(outcome.snapshot.finished);
    assert_eq!(outcome.snapshot.progress(), 1.0);

    let history = runtime.history(outcome.run_id).await.unwrap();
    assert_eq!(history.status, Some(RunStatus::Succeeded));
    assert_eq!(
        history.task(&TaskId::new("publish")).unwrap().status,
        TaskStatus::Succeeded
    );

    let metrics = runtime.metrics().summary();
    assert_eq!(metrics.started, 1);
    assert_eq!(metrics.succeeded, 1);
}

#[tokio::test]
async fn test_finished_run_is_evicted_after_wait() {
    let root = tempfile::tempdir().unwrap();
    write_workflows(root.path());
    let runtime = Runtime::with_registry(config(root.path()), registry());
    runtime.load_workflows_dir().await.unwrap();

    let run_id = runtime
        .start("release", json!({ "version": "1.2.0" }))
        .await
        .unwrap();
    let outcome = runtime.wait(run_id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);

    assert!(matches!(
        runtime.status(run_id),
        Err(RuntimeError::UnknownRun(_))
    ));
    assert!(matches!(
        runtime.cancel(run_id, "late"),
        Err(RuntimeError::UnknownRun(_))
    ));
    assert!(matches!(
        runtime.wait(run_id).await,
        Err(RuntimeError::UnknownRun(_))
    ));

    // The audit trail survives eviction on disk.
    let records = runtime.audit_log(run_id).await.unwrap();
    assert!(!records.is_empty());
    verify_chain(&records).unwrap();
    let history = runtime.history(run_id).await.unwrap();
    assert_eq!(history.status, Some(RunStatus::Succeeded));
}

#[tokio::test]
async fn test_unknown_workflow_and_run() {
    let root = tempfile::tempdir().unwrap();
    let runtime = Runtime::with_registry(config(root.path()), registry());

    let err = runtime.start("ghost", Payload::Null).await.unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownWorkflow(_)));
    assert_eq!(ExitStatus::from_error(&err), ExitStatus::Usage);

    let run_id = RunId::new();
    assert!(matches!(
        runtime.status(run_id),
        Err(RuntimeError::UnknownRun(id)) if id == run_id
    ));
    assert!(matches!(
        runtime.audit_log(run_id).await,
        Err(RuntimeError::UnknownRun(_))
    ));
}

#[tokio::test]
async fn test_cancel_rolls_back_and_persists_audit() {
    let root = tempfile::tempdir().unwrap();
    write_workflows(root.path());

    let publishing = Arc::new(Notify::new());
    let signal = Arc::clone(&publishing);
    let registry = registry().with_worker(
        "publisher",
        FunctionWorker::new(move |input, _ctx| {
            signal.notify_one();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(input)
            }
        }),
    );
    let runtime = Runtime::with_registry(config(root.path()), registry);
    runtime.load_workflows_dir().await.unwrap();

    let run_id = runtime
        .start("release", json!({ "version": "1.2.0" }))
        .await
        .unwrap();
    publishing.notified().await;
    assert!(runtime.cancel(run_id, "operator request").unwrap());

    let outcome = runtime.wait(run_id).await.unwrap();
    assert!(outcome.was_cancelled());
    assert_eq!(ExitStatus::from_outcome(&outcome), ExitStatus::Cancelled);
    assert_eq!(outcome.status, RunStatus::RolledBack);
    // "unpublish" covers publish alone, which never succeeded.
    assert_eq!(outcome.rollback.unwrap().skipped_steps, vec!["unpublish"]);
    assert_eq!(runtime.metrics().count(MetricKind::RunCancelled), 1);

    // A second runtime sees the run only through its audit file.
    let other = Runtime::with_registry(config(root.path()), WorkerRegistry::new());
    let history = other.history(run_id).await.unwrap();
    assert_eq!(history.status, Some(RunStatus::RolledBack));
    let publish = history.task(&TaskId::new("publish")).unwrap();
    assert_eq!(publish.status, TaskStatus::Failed);
    assert_eq!(publish.last_error, Some(ErrorKind::Cancelled));
}

#[tokio::test]
async fn test_bundled_configuration_loads_bundled_workflows() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
    let config = RuntimeConfig::load(&root.join("relay.toml")).unwrap();
    assert_eq!(config.workers.len(), 5);

    let runtime = Runtime::new(config);
    assert_eq!(runtime.load_workflows_dir().await.unwrap(), 1);
    assert_eq!(runtime.workflows(), vec!["fix-issue"]);
}
