//! Workflow configuration.
//!
//! A closed set of named options attached to a workflow definition. The
//! descriptive options (methodology, complexity, verification level, rollout
//! strategy) are visible to input templates as `{{config.<field>}}`; the
//! verification level also selects which success criteria are evaluated.
//! The remaining options provide engine defaults for retry and timeouts.

use crate::workflow::retry::{Backoff, RetryOn, RetryPolicy};
use crate::workflow::timeout::{RollbackTimeout, TaskTimeout, WorkflowTimeout};
use relay_core::Payload;
use serde::{Deserialize, Serialize};

/// Development methodology the workflow follows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Methodology {
    #[default]
    Traditional,
    Tdd,
    Bdd,
}

/// Declared complexity of the work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

/// How much verification the run demands.
///
/// Ordered: `Minimal < Standard < Strict`. A criterion declared at level L
/// is evaluated when the configured level is at least L.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    Minimal,
    #[default]
    Standard,
    Strict,
}

/// How produced changes are rolled out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutStrategy {
    #[default]
    Direct,
    Canary,
    FeatureFlag,
    BlueGreen,
}

/// Field names templates may reference as `config.<field>`.
pub const CONFIG_FIELDS: &[&str] = &[
    "methodology",
    "complexity",
    "verification_level",
    "rollout_strategy",
    "max_attempts",
    "backoff",
    "task_timeout_ms",
    "workflow_timeout_ms",
    "rollback",
];

/// Closed workflow configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    pub methodology: Methodology,
    pub complexity: Complexity,
    pub verification_level: VerificationLevel,
    pub rollout_strategy: RolloutStrategy,
    /// Attempt budget for tasks without their own retry policy
    pub max_attempts: u32,
    /// Backoff for tasks without their own retry policy
    pub backoff: Backoff,
    /// Per-attempt timeout for tasks without their own
    #[serde(rename = "task_timeout_ms")]
    pub task_timeout: TaskTimeout,
    /// Whole-run limit; unset means unbounded
    #[serde(rename = "workflow_timeout_ms")]
    pub workflow_timeout: Option<WorkflowTimeout>,
    /// Rollback step and total limits
    pub rollback: RollbackTimeout,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            methodology: Methodology::default(),
            complexity: Complexity::default(),
            verification_level: VerificationLevel::default(),
            rollout_strategy: RolloutStrategy::default(),
            max_attempts: 3,
            backoff: Backoff::default(),
            task_timeout: TaskTimeout::default(),
            workflow_timeout: None,
            rollback: RollbackTimeout::default(),
        }
    }
}

impl WorkflowConfig {
    /// Retry policy applied to tasks that do not declare one.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            retry_on: RetryOn::Transient,
        }
    }

    /// Returns true if `field` names a configuration option.
    pub fn is_known_field(field: &str) -> bool {
        CONFIG_FIELDS.contains(&field)
    }

    /// Reads one option as a payload value.
    ///
    /// Unset optional fields read as `null`; unknown fields as `None`.
    pub fn lookup(&self, field: &str) -> Option<Payload> {
        if !Self::is_known_field(field) {
            return None;
        }
        serde_json::to_value(self)
            .ok()
            .and_then(|value| value.get(field).cloned())
    }

    /// Checks option values, returning one message per problem.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if let Err(msg) = self.backoff.check() {
            problems.push(msg);
        }
        if self.task_timeout.duration().is_zero() {
            problems.push("task_timeout_ms must be positive".to_string());
        }
        if self
            .workflow_timeout
            .is_some_and(|t| t.duration().is_zero())
        {
            problems.push("workflow_timeout_ms must be positive".to_string());
        }
        if self.rollback.step.is_zero() || self.rollback.total.is_zero() {
            problems.push("rollback limits must be positive".to_string());
        }
        problems
    }
}
