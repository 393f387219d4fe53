//! Workflow orchestration system for phased, multi-worker processes.
//!
//! The workflow module drives a [`WorkflowDefinition`] to a terminal state:
//! - Validates definitions for cycles, unknown references and bad
//!   configuration before anything runs
//! - Executes phases in order, dispatching tasks sequentially or in parallel
//! - Resolves task inputs from earlier results through the context store
//! - Retries failed attempts with backoff and enforces per-attempt timeouts
//! - Evaluates success criteria once every phase has passed
//! - Rolls back succeeded tasks in reverse completion order on failure
//!
//! # Architecture
//!
//! - [`WorkflowDefinition`]: phases of [`TaskDescriptor`]s plus
//!   [`WorkflowConfig`], [`SuccessCriterion`]s and a rollback plan
//! - [`WorkerInvoker`]: calls registered [`Worker`]s under a timeout and a
//!   cancellation token; [`Router`]s pick workers from the context
//! - [`Orchestrator`]: creates a [`WorkflowRun`] and advances it phase by
//!   phase
//! - [`RollbackExecutor`]: best-effort saga compensation
//!
//! # Example
//!
//! ```ignore
//! use relay_agent::workflow::{FunctionWorker, Orchestrator, Phase, TaskDescriptor,
//!     WorkerRegistry, WorkflowBuilder};
//! use serde_json::json;
//!
//! let registry = WorkerRegistry::new()
//!     .with_worker("echo", FunctionWorker::new(|input, _ctx| async move { Ok(input) }));
//!
//! let definition = WorkflowBuilder::new("hello")
//!     .phase(Phase::sequential("greet").with_task(
//!         TaskDescriptor::new("greet", "echo").with_input(json!({ "who": "{{args.name}}" })),
//!     ))
//!     .build()?;
//!
//! let outcome = Orchestrator::new(registry)
//!     .execute(definition, json!({ "name": "world" }))
//!     .await?;
//! assert!(outcome.is_success());
//! ```
//!
//! # Execution Model
//!
//! 1. Validate the definition against the registered workers
//! 2. For each phase, dispatch tasks whose dependencies have succeeded
//! 3. Record every terminal task result in the context store
//! 4. On a fatal failure, skip what is left and run the rollback plan
//! 5. After the last phase, evaluate the success criteria

pub mod builder;
pub mod cancellation;
pub mod config;
pub mod criteria;
pub mod dag;
pub mod definition;
pub mod error;
pub mod orchestrator;
pub mod phase;
pub mod retry;
pub mod rollback;
pub mod router;
pub mod state;
pub mod task;
pub mod template;
pub mod timeout;
pub mod validate;
pub mod worker;
pub mod yaml;

// Re-export core types for public API
pub use builder::WorkflowBuilder;
pub use cancellation::{CancellationToken, CancellationTokenSource};
pub use config::{Complexity, Methodology, RolloutStrategy, VerificationLevel, WorkflowConfig};
pub use criteria::{
    evaluate, CompareOp, CriteriaReport, Predicate, Severity, SuccessCriterion, UnmetCriterion,
    UnmetReason,
};
pub use dag::DependencyGraph;
pub use definition::WorkflowDefinition;
pub use error::WorkflowError;
pub use orchestrator::{Orchestrator, RunOutcome, WorkflowRun};
pub use phase::{ConcurrencyMode, Phase, PhaseStatus};
pub use retry::{Backoff, RetryOn, RetryPolicy};
pub use rollback::{
    CompensationOutcome, CompensationStatus, CompensationStep, RollbackExecutor, RollbackReport,
};
pub use router::{Router, WorkerRef};
pub use state::{FatalError, PhaseSummary, RunSnapshot, RunStatus, TaskSummary};
pub use task::TaskDescriptor;
pub use template::{InputTemplate, Reference, TemplateError};
pub use timeout::{RollbackTimeout, TaskTimeout, WorkflowTimeout};
pub use validate::{ValidationError, ValidationReport, ValidationWarning, WorkflowValidator};
pub use worker::{
    FunctionWorker, InvocationContext, Worker, WorkerFailure, WorkerInvoker, WorkerRegistry,
    WorkerRegistryError,
};
pub use yaml::{load_definition_from_file, load_definition_from_str, YamlWorkflowError};
