//! RelayKit runtime layer - the control surface over the workflow engine.
//!
//! This crate hosts workflow runs for a process:
//!
//! - A workflow catalog loaded from a directory of YAML definitions
//! - A run registry with start, status, cancel, wait and audit access
//! - Process-backed workers configured in TOML
//! - Exit codes and run metrics for the `relay` binary
//!
//! # Examples
//!
//! ```rust,no_run
//! use relay_runtime::{Runtime, RuntimeConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::default());
//! runtime.load_workflows_dir().await?;
//!
//! let run_id = runtime.start("fix-issue", json!({ "issue": 42 })).await?;
//! let outcome = runtime.wait(run_id).await?;
//! println!("{}", outcome.status);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod exit;
pub mod metrics;

pub use command::CommandWorker;
pub use config::{CommandWorkerConfig, ConfigError, RuntimeConfig};
pub use exit::ExitStatus;
pub use metrics::{MetricKind, MetricsSummary, RuntimeMetrics};

use relay_agent::audit::{AuditError, AuditLog, AuditRecord, RunHistory};
use relay_agent::workflow::{
    load_definition_from_file, CancellationTokenSource, WorkerRegistry, WorkflowValidator,
    YamlWorkflowError,
};
use relay_agent::{Orchestrator, RunOutcome, RunSnapshot, WorkflowDefinition, WorkflowError};
use relay_core::{Payload, RunId};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Errors from the runtime control surface.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("workflow {0} is already registered")]
    DuplicateWorkflow(String),

    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    #[error("run {0} ended without an outcome")]
    Lost(RunId),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("{path}: {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: YamlWorkflowError,
    },

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handles kept for one unfinished run.
#[derive(Clone)]
struct RunHandle {
    snapshot: watch::Receiver<RunSnapshot>,
    canceller: CancellationTokenSource,
    audit: AuditLog,
    outcome: watch::Receiver<Option<Arc<RunOutcome>>>,
}

/// Registry entry for a run.
///
/// A finished run keeps only its outcome until [`Runtime::wait`] takes it.
#[derive(Clone)]
enum RunEntry {
    Active(RunHandle),
    Finished(Arc<RunOutcome>),
}

type RunTable = Mutex<HashMap<RunId, RunEntry>>;

fn lock_runs(runs: &RunTable) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
    runs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hosts workflow runs.
///
/// Every run executes on its own tokio task; the runtime keeps handles to
/// observe, cancel and await it until its outcome is taken.
pub struct Runtime {
    config: RuntimeConfig,
    orchestrator: Orchestrator,
    workflows: RwLock<BTreeMap<String, Arc<WorkflowDefinition>>>,
    runs: Arc<RunTable>,
    metrics: RuntimeMetrics,
}

impl Runtime {
    /// Creates a runtime whose workers are the configured command workers.
    pub fn new(config: RuntimeConfig) -> Self {
        let registry = config.worker_registry();
        Self::with_registry(config, registry)
    }

    /// Creates a runtime over an explicit worker registry.
    pub fn with_registry(config: RuntimeConfig, registry: WorkerRegistry) -> Self {
        let orchestrator = Orchestrator::new(registry).with_audit_dir(config.audit_dir.clone());
        Self {
            config,
            orchestrator,
            workflows: RwLock::new(BTreeMap::new()),
            runs: Arc::new(Mutex::new(HashMap::new())),
            metrics: RuntimeMetrics::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
        lock_runs(&self.runs)
    }

    fn entry(&self, run_id: RunId) -> Result<RunEntry, RuntimeError> {
        self.runs()
            .get(&run_id)
            .cloned()
            .ok_or(RuntimeError::UnknownRun(run_id))
    }

    /// Adds a definition to the catalog.
    ///
    /// The definition is validated against the registered workers.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), RuntimeError> {
        let report = WorkflowValidator::new()
            .with_workers(self.orchestrator.invoker().registry().ids())
            .validate(&definition);
        if !report.is_valid() {
            return Err(WorkflowError::Validation(report).into());
        }

        let mut workflows = self.workflows.write().unwrap_or_else(|e| e.into_inner());
        if workflows.contains_key(&definition.name) {
            return Err(RuntimeError::DuplicateWorkflow(definition.name));
        }
        debug!(workflow = %definition.name, "registered workflow");
        workflows.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Loads and registers one YAML definition, returning its name.
    pub async fn register_file(&self, path: impl AsRef<Path>) -> Result<String, RuntimeError> {
        let path = path.as_ref();
        let definition =
            load_definition_from_file(path)
                .await
                .map_err(|source| RuntimeError::Definition {
                    path: path.to_path_buf(),
                    source,
                })?;
        let name = definition.name.clone();
        self.register_workflow(definition)?;
        Ok(name)
    }

    /// Registers every `*.yaml` / `*.yml` file in the workflows directory.
    ///
    /// A missing directory registers nothing. Returns the number of
    /// definitions registered.
    pub async fn load_workflows_dir(&self) -> Result<usize, RuntimeError> {
        let dir = &self.config.workflows_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "workflows directory not found");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            self.register_file(path).await?;
        }
        info!(dir = %dir.display(), count = paths.len(), "loaded workflows");
        Ok(paths.len())
    }

    /// Names of the registered workflows, sorted.
    pub fn workflows(&self) -> Vec<String> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Starts a registered workflow with an argument payload.
    ///
    /// Returns once the run is accepted; it executes in the background.
    pub async fn start(&self, workflow: &str, args: Payload) -> Result<RunId, RuntimeError> {
        let definition = self
            .workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownWorkflow(workflow.to_string()))?;

        let run = match self.orchestrator.start(definition, args).await {
            Ok(run) => run,
            Err(e) => {
                self.metrics.record(MetricKind::RunRejected);
                return Err(e.into());
            }
        };
        self.metrics.record(MetricKind::RunStarted);

        let run_id = run.run_id();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = RunHandle {
            snapshot: run.subscribe(),
            canceller: run.canceller(),
            audit: run.audit_log().clone(),
            outcome: outcome_rx,
        };
        self.runs().insert(run_id, RunEntry::Active(handle));

        let orchestrator = self.orchestrator.clone();
        let metrics = self.metrics.clone();
        let runs = Arc::clone(&self.runs);
        let started = Instant::now();
        tokio::spawn(async move {
            let outcome = Arc::new(orchestrator.run_to_completion(run).await);
            let elapsed = started.elapsed();
            metrics.record_outcome(&outcome, elapsed);
            debug!(run_id = %run_id, elapsed_ms = elapsed.as_millis() as u64, "run outcome recorded");
            // Drops the run's channels and in-memory audit log.
            lock_runs(&runs).insert(run_id, RunEntry::Finished(Arc::clone(&outcome)));
            outcome_tx.send_replace(Some(outcome));
        });

        info!(run_id = %run_id, workflow, "run started");
        Ok(run_id)
    }

    /// Starts a workflow and waits for its outcome.
    pub async fn run(&self, workflow: &str, args: Payload) -> Result<RunOutcome, RuntimeError> {
        let run_id = self.start(workflow, args).await?;
        self.wait(run_id).await
    }

    /// Current snapshot of a run that has not been waited on yet.
    pub fn status(&self, run_id: RunId) -> Result<RunSnapshot, RuntimeError> {
        match self.entry(run_id)? {
            RunEntry::Active(handle) => {
                let snapshot = handle.snapshot.borrow().clone();
                Ok(snapshot)
            }
            RunEntry::Finished(outcome) => Ok(outcome.snapshot.clone()),
        }
    }

    /// Requests cancellation of a run.
    ///
    /// Returns false if the run was already cancelled or has finished.
    pub fn cancel(&self, run_id: RunId, reason: impl Into<String>) -> Result<bool, RuntimeError> {
        let handle = match self.entry(run_id)? {
            RunEntry::Active(handle) => handle,
            RunEntry::Finished(_) => return Ok(false),
        };
        let reason = reason.into();
        info!(run_id = %run_id, reason = %reason, "cancellation requested");
        Ok(handle.canceller.cancel(reason))
    }

    /// Requests cancellation of every unfinished run.
    pub fn cancel_all(&self, reason: &str) {
        let handles: Vec<RunHandle> = self
            .runs()
            .values()
            .filter_map(|entry| match entry {
                RunEntry::Active(handle) => Some(handle.clone()),
                RunEntry::Finished(_) => None,
            })
            .collect();
        for handle in handles {
            handle.canceller.cancel(reason);
        }
    }

    /// Waits for a run to finish and takes its outcome.
    ///
    /// The run is then evicted from the registry; its history stays
    /// available from the persisted audit file.
    pub async fn wait(&self, run_id: RunId) -> Result<RunOutcome, RuntimeError> {
        let outcome = match self.entry(run_id)? {
            RunEntry::Finished(outcome) => outcome,
            RunEntry::Active(handle) => {
                let mut receiver = handle.outcome;
                let finished = receiver
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| RuntimeError::Lost(run_id))?
                    .clone();
                finished.ok_or(RuntimeError::Lost(run_id))?
            }
        };
        self.runs().remove(&run_id);
        debug!(run_id = %run_id, "run evicted");
        Ok(outcome.as_ref().clone())
    }

    /// Audit records of a run.
    ///
    /// Unfinished runs are read from memory; finished and foreign runs are
    /// read from their persisted audit file.
    pub async fn audit_log(&self, run_id: RunId) -> Result<Vec<AuditRecord>, RuntimeError> {
        if let Ok(RunEntry::Active(handle)) = self.entry(run_id) {
            return Ok(handle.audit.records().await);
        }
        let path = AuditLog::file_path(&self.config.audit_dir, run_id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(RuntimeError::UnknownRun(run_id));
        }
        Ok(AuditLog::load(&path).await?)
    }

    /// Run history replayed from the audit log.
    pub async fn history(&self, run_id: RunId) -> Result<RunHistory, RuntimeError> {
        Ok(RunHistory::from_records(&self.audit_log(run_id).await?))
    }
}
