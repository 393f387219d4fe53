//! YAML workflow definition and parsing.
//!
//! A workflow document declares its worker catalog, configuration, phases,
//! success criteria and rollback plan. Documents are converted into a
//! [`WorkflowDefinition`] and validated before they are returned, so no
//! task of a malformed document can ever start.
//!
//! ```yaml
//! name: fix-issue
//! workers: [detector, rust-fixer, generic-fixer, reverter]
//! config:
//!   verification_level: strict
//!   max_attempts: 2
//! phases:
//!   - id: detect
//!     tasks:
//!       - id: detect
//!         worker: detector
//!         input: { issue: "{{args.issue}}" }
//!   - id: fix
//!     mode: parallel
//!     tasks:
//!       - id: fix
//!         route:
//!           name: by-language
//!           task: detect
//!           path: language
//!           routes:
//!             - when: rust
//!               worker: rust-fixer
//!           fallback: generic-fixer
//!         input: "{{detect.report}}"
//! criteria:
//!   - id: tests-pass
//!     task: fix
//!     path: tests.failed
//!     op: "=="
//!     value: 0
//! rollback:
//!   - id: revert-fix
//!     tasks: [fix]
//!     worker: reverter
//! ```

use crate::workflow::config::{VerificationLevel, WorkflowConfig};
use crate::workflow::criteria::{CompareOp, Predicate, Severity, SuccessCriterion};
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::phase::{ConcurrencyMode, Phase};
use crate::workflow::retry::{Backoff, RetryOn, RetryPolicy};
use crate::workflow::rollback::CompensationStep;
use crate::workflow::router::{Router, WorkerRef};
use crate::workflow::task::TaskDescriptor;
use crate::workflow::timeout::TaskTimeout;
use crate::workflow::validate::{ValidationReport, WorkflowValidator};
use relay_core::{ErrorKind, FieldPath, Payload, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Closed worker catalog
    #[serde(default)]
    pub workers: Vec<WorkerId>,
    #[serde(default)]
    pub config: WorkflowConfig,
    pub phases: Vec<YamlPhase>,
    #[serde(default)]
    pub criteria: Vec<YamlCriterion>,
    #[serde(default)]
    pub rollback: Vec<YamlCompensation>,
}

/// Phase definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlPhase {
    pub id: String,
    #[serde(default)]
    pub mode: ConcurrencyMode,
    pub tasks: Vec<YamlTask>,
}

/// Task definition. Exactly one of `worker` and `route` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlTask {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub worker: Option<WorkerId>,
    #[serde(default)]
    pub route: Option<YamlRoute>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Input template; placeholders use `{{task.path}}`, `{{args.path}}`
    /// and `{{config.field}}`
    #[serde(default)]
    pub input: Payload,
    #[serde(default)]
    pub retry: Option<YamlRetry>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub allow_failure: bool,
}

/// Router matching a field of an upstream task's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlRoute {
    pub name: String,
    pub task: String,
    pub path: FieldPath,
    #[serde(default)]
    pub routes: Vec<YamlRouteCase>,
    #[serde(default)]
    pub fallback: Option<WorkerId>,
}

/// One `value -> worker` case of a router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlRouteCase {
    pub when: Payload,
    pub worker: WorkerId,
}

/// Retry overrides; unset fields fall back to the workflow config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlRetry {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    /// Retry only these error kinds; an empty list retries nothing
    #[serde(default)]
    pub retry_on: Option<Vec<ErrorKind>>,
    /// Retry only worker errors carrying one of these codes
    #[serde(default)]
    pub retry_codes: Option<Vec<String>>,
}

/// Success criterion.
///
/// Either a full `predicate`, or the shorthand `task` with optional `path`,
/// `op` and `value`: with `op` it compares, with only `path` it checks the
/// field exists, with neither it checks the task succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlCriterion {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Combinators are written as single-key maps (`any: [...]`)
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub predicate: Option<Predicate>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub path: Option<FieldPath>,
    #[serde(default)]
    pub op: Option<CompareOp>,
    #[serde(default)]
    pub value: Option<Payload>,
    #[serde(default)]
    pub severity: Severity,
    /// Lowest verification level at which the criterion applies
    #[serde(default)]
    pub level: Option<VerificationLevel>,
}

/// Compensation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlCompensation {
    pub id: String,
    pub tasks: Vec<String>,
    pub worker: WorkerId,
    #[serde(default)]
    pub input: Payload,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Errors that can occur during YAML workflow loading.
#[derive(Error, Debug)]
pub enum YamlWorkflowError {
    /// Document parsed but is structurally wrong
    #[error("Invalid workflow schema: {0}")]
    InvalidSchema(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Definition failed validation
    #[error("Workflow validation failed: {0}")]
    Validation(ValidationReport),
}

impl YamlTask {
    fn into_descriptor(self, config: &WorkflowConfig) -> Result<TaskDescriptor, YamlWorkflowError> {
        let worker: WorkerRef = match (self.worker, self.route) {
            (Some(worker), None) => worker.into(),
            (None, Some(route)) => {
                let mut router = Router::matching(route.name, route.task, route.path);
                for case in route.routes {
                    router = router.route(case.when, case.worker);
                }
                if let Some(fallback) = route.fallback {
                    router = router.fallback(fallback);
                }
                router.into()
            }
            (Some(_), Some(_)) => {
                return Err(YamlWorkflowError::InvalidSchema(format!(
                    "task {} sets both worker and route",
                    self.id
                )))
            }
            (None, None) => {
                return Err(YamlWorkflowError::InvalidSchema(format!(
                    "task {} needs a worker or a route",
                    self.id
                )))
            }
        };

        let mut task = TaskDescriptor::new(self.id, worker).with_input(self.input);
        if let Some(name) = self.name {
            task = task.with_name(name);
        }
        for dep in self.depends_on {
            task = task.depends_on(dep);
        }
        if let Some(retry) = self.retry {
            task = task.with_retry(retry.into_policy(config));
        }
        if let Some(ms) = self.timeout_ms {
            task = task.with_timeout(TaskTimeout::from_millis(ms));
        }
        if self.allow_failure {
            task = task.allow_failure();
        }
        Ok(task)
    }
}

impl YamlRetry {
    fn into_policy(self, config: &WorkflowConfig) -> RetryPolicy {
        let mut policy = config.default_retry_policy();
        if let Some(max_attempts) = self.max_attempts {
            policy.max_attempts = max_attempts;
        }
        if let Some(backoff) = self.backoff {
            policy.backoff = backoff;
        }
        policy.retry_on = match (self.retry_codes, self.retry_on) {
            (Some(codes), _) => RetryOn::WorkerCodes(codes),
            (None, Some(kinds)) if kinds.is_empty() => RetryOn::Never,
            (None, Some(kinds)) => RetryOn::Kinds(kinds),
            (None, None) => RetryOn::Transient,
        };
        policy
    }
}

impl YamlCriterion {
    fn into_criterion(self) -> Result<SuccessCriterion, YamlWorkflowError> {
        let predicate = match (self.predicate, self.task) {
            (Some(predicate), None) => predicate,
            (None, Some(task)) => match (self.path, self.op, self.value) {
                (path, Some(op), Some(value)) => {
                    Predicate::compare(task, path.unwrap_or_else(FieldPath::root), op, value)
                }
                (_, Some(_), None) | (_, None, Some(_)) => {
                    return Err(YamlWorkflowError::InvalidSchema(format!(
                        "criterion {} needs both op and value",
                        self.id
                    )))
                }
                (Some(path), None, None) => Predicate::Exists {
                    task: TaskId::new(task),
                    path,
                },
                (None, None, None) => Predicate::Succeeded {
                    task: TaskId::new(task),
                },
            },
            (Some(_), Some(_)) => {
                return Err(YamlWorkflowError::InvalidSchema(format!(
                    "criterion {} sets both predicate and task",
                    self.id
                )))
            }
            (None, None) => {
                return Err(YamlWorkflowError::InvalidSchema(format!(
                    "criterion {} needs a predicate or a task",
                    self.id
                )))
            }
        };

        let mut criterion = SuccessCriterion::new(self.id, predicate);
        if let Some(description) = self.description {
            criterion = criterion.with_description(description);
        }
        if self.severity == Severity::Soft {
            criterion = criterion.soft();
        }
        if let Some(level) = self.level {
            criterion = criterion.at_level(level);
        }
        Ok(criterion)
    }
}

impl YamlCompensation {
    fn into_step(self) -> Result<CompensationStep, YamlWorkflowError> {
        let mut tasks = self.tasks.into_iter();
        let first = tasks.next().ok_or_else(|| {
            YamlWorkflowError::InvalidSchema(format!("rollback step {} lists no tasks", self.id))
        })?;
        let mut step = CompensationStep::new(self.id, first, self.worker).with_input(self.input);
        for task in tasks {
            step = step.also_for(task);
        }
        if let Some(ms) = self.timeout_ms {
            step = step.with_timeout(Duration::from_millis(ms));
        }
        Ok(step)
    }
}

impl TryFrom<YamlWorkflow> for WorkflowDefinition {
    type Error = YamlWorkflowError;

    fn try_from(doc: YamlWorkflow) -> Result<Self, Self::Error> {
        let mut definition = WorkflowDefinition::new(doc.name);
        definition.description = doc.description.unwrap_or_default();
        definition.workers = doc.workers.into_iter().collect();

        for yaml_phase in doc.phases {
            let mut phase = Phase::new(yaml_phase.id, yaml_phase.mode);
            for yaml_task in yaml_phase.tasks {
                phase = phase.with_task(yaml_task.into_descriptor(&doc.config)?);
            }
            definition.phases.push(phase);
        }
        definition.criteria = doc
            .criteria
            .into_iter()
            .map(YamlCriterion::into_criterion)
            .collect::<Result<_, _>>()?;
        definition.rollback_plan = doc
            .rollback
            .into_iter()
            .map(YamlCompensation::into_step)
            .collect::<Result<_, _>>()?;
        definition.config = doc.config;
        Ok(definition)
    }
}

/// Loads and validates a workflow from a YAML string.
///
/// # Returns
///
/// - `Ok(WorkflowDefinition)` - If the document parsed and is valid
/// - `Err(YamlWorkflowError)` - Parse, schema or validation failure
pub fn load_definition_from_str(yaml: &str) -> Result<WorkflowDefinition, YamlWorkflowError> {
    let doc: YamlWorkflow = serde_yaml::from_str(yaml)?;
    let definition = WorkflowDefinition::try_from(doc)?;

    let report = WorkflowValidator::new().validate(&definition);
    for warning in report.warnings() {
        warn!(workflow = %definition.name, "{warning}");
    }
    if !report.is_valid() {
        return Err(YamlWorkflowError::Validation(report));
    }
    Ok(definition)
}

/// Loads and validates a workflow from a YAML file.
///
/// # Example
///
/// ```ignore
/// use relay_agent::workflow::yaml::load_definition_from_file;
///
/// let definition = load_definition_from_file("workflows/release.yaml").await?;
/// ```
pub async fn load_definition_from_file(
    path: impl AsRef<Path>,
) -> Result<WorkflowDefinition, YamlWorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    load_definition_from_str(&content)
}
