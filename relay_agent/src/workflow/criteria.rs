//! Success criteria.
//!
//! Criteria are predicates over the final context store, checked once after
//! every phase has finished. A criterion can fail a run even when every task
//! nominally succeeded ("coverage must be at least 80").
//!
//! Evaluation is a pure function of the criteria, the store and the
//! configured verification level: a missing task or field makes the
//! criterion unmet, it never panics, and evaluating twice over an unchanged
//! store yields the same report.

use crate::workflow::config::VerificationLevel;
use relay_core::{ContextStore, FieldPath, Payload, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
}

impl CompareOp {
    fn holds(&self, actual: &Payload, expected: &Payload) -> bool {
        match self {
            CompareOp::Eq => values_equal(actual, expected),
            CompareOp::Ne => !values_equal(actual, expected),
            CompareOp::Gt => compare(actual, expected) == Some(Ordering::Greater),
            CompareOp::Ge => matches!(
                compare(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompareOp::Lt => compare(actual, expected) == Some(Ordering::Less),
            CompareOp::Le => matches!(
                compare(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        };
        f.write_str(s)
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

// Integers compare exactly; 85 and 85.0 compare equal.
fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
    match (as_integer(x), as_integer(y)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

fn values_equal(a: &Payload, b: &Payload) -> bool {
    match (a, b) {
        (Payload::Number(x), Payload::Number(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn compare(a: &Payload, b: &Payload) -> Option<Ordering> {
    match (a, b) {
        (Payload::Number(x), Payload::Number(y)) => compare_numbers(x, y),
        (Payload::String(x), Payload::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Predicate over the context store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `task.path <op> value`
    Compare {
        task: TaskId,
        path: FieldPath,
        op: CompareOp,
        value: Payload,
    },
    /// The field exists in the task's output
    Exists { task: TaskId, path: FieldPath },
    /// The task succeeded
    Succeeded { task: TaskId },
    /// Every inner predicate holds
    All(Vec<Predicate>),
    /// At least one inner predicate holds
    Any(Vec<Predicate>),
    /// The inner predicate does not hold
    Not(Box<Predicate>),
}

impl Predicate {
    /// Shorthand for [`Predicate::Compare`].
    pub fn compare(
        task: impl Into<TaskId>,
        path: FieldPath,
        op: CompareOp,
        value: Payload,
    ) -> Self {
        Predicate::Compare {
            task: task.into(),
            path,
            op,
            value,
        }
    }

    /// Every task id the predicate reads.
    pub fn referenced_tasks(&self) -> Vec<&TaskId> {
        let mut out = Vec::new();
        self.collect_tasks(&mut out);
        out
    }

    fn collect_tasks<'a>(&'a self, out: &mut Vec<&'a TaskId>) {
        match self {
            Predicate::Compare { task, .. }
            | Predicate::Exists { task, .. }
            | Predicate::Succeeded { task } => out.push(task),
            Predicate::All(inner) | Predicate::Any(inner) => {
                inner.iter().for_each(|p| p.collect_tasks(out))
            }
            Predicate::Not(inner) => inner.collect_tasks(out),
        }
    }

    /// Checks the predicate, describing why it does not hold.
    pub fn check(&self, context: &ContextStore) -> Result<(), UnmetReason> {
        match self {
            Predicate::Compare {
                task,
                path,
                op,
                value,
            } => {
                let actual = context
                    .lookup(task, path)
                    .map_err(|e| UnmetReason::MissingReference {
                        reference: label(task, path),
                        detail: e.to_string(),
                    })?;
                if op.holds(&actual, value) {
                    Ok(())
                } else {
                    Err(UnmetReason::Mismatch {
                        reference: label(task, path),
                        actual,
                        op: *op,
                        expected: value.clone(),
                    })
                }
            }
            Predicate::Exists { task, path } => context
                .lookup(task, path)
                .map(|_| ())
                .map_err(|e| UnmetReason::MissingReference {
                    reference: label(task, path),
                    detail: e.to_string(),
                }),
            Predicate::Succeeded { task } => {
                if context.is_succeeded(task) {
                    Ok(())
                } else {
                    Err(UnmetReason::NotSucceeded {
                        task: task.clone(),
                        status: context.status(task),
                    })
                }
            }
            Predicate::All(inner) => inner.iter().try_for_each(|p| p.check(context)),
            Predicate::Any(inner) => {
                let mut reasons = Vec::new();
                for p in inner {
                    match p.check(context) {
                        Ok(()) => return Ok(()),
                        Err(reason) => reasons.push(reason),
                    }
                }
                Err(UnmetReason::NoneHeld {
                    alternatives: reasons,
                })
            }
            // An absent input stays unmet under negation.
            Predicate::Not(inner) => match inner.check(context) {
                Ok(()) => Err(UnmetReason::Negated),
                Err(reason) if reason.is_missing() => Err(reason),
                Err(_) => Ok(()),
            },
        }
    }
}

fn label(task: &TaskId, path: &FieldPath) -> String {
    if path.is_root() {
        task.to_string()
    } else {
        format!("{task}.{path}")
    }
}

/// Whether an unmet criterion fails the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Unmet criterion fails the run and triggers rollback
    #[default]
    Hard,
    /// Unmet criterion is reported only
    Soft,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Hard => f.write_str("hard"),
            Severity::Soft => f.write_str("soft"),
        }
    }
}

/// Named post-run predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub predicate: Predicate,
    #[serde(default)]
    pub severity: Severity,
    /// Lowest verification level at which the criterion applies
    #[serde(default = "minimal_level")]
    pub level: VerificationLevel,
}

fn minimal_level() -> VerificationLevel {
    VerificationLevel::Minimal
}

impl SuccessCriterion {
    /// Creates a hard criterion applying at every verification level.
    pub fn new(id: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            predicate,
            severity: Severity::Hard,
            level: VerificationLevel::Minimal,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Marks the criterion soft.
    pub fn soft(mut self) -> Self {
        self.severity = Severity::Soft;
        self
    }

    /// Sets the lowest applicable verification level.
    pub fn at_level(mut self, level: VerificationLevel) -> Self {
        self.level = level;
        self
    }

    /// Returns true if the criterion applies at `level`.
    pub fn applies_at(&self, level: VerificationLevel) -> bool {
        level >= self.level
    }
}

/// Why a predicate does not hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnmetReason {
    /// Referenced task or field is absent
    MissingReference { reference: String, detail: String },
    /// Value present but comparison false
    Mismatch {
        reference: String,
        actual: Payload,
        op: CompareOp,
        expected: Payload,
    },
    /// Task did not succeed
    NotSucceeded {
        task: TaskId,
        status: Option<TaskStatus>,
    },
    /// No alternative of an `any` held
    NoneHeld { alternatives: Vec<UnmetReason> },
    /// A negated predicate held
    Negated,
}

impl UnmetReason {
    /// True when the predicate could not be decided because a referenced
    /// task or field is absent, as opposed to evaluating to false.
    pub fn is_missing(&self) -> bool {
        match self {
            UnmetReason::MissingReference { .. } => true,
            UnmetReason::NotSucceeded { status, .. } => status.is_none(),
            UnmetReason::NoneHeld { alternatives } => alternatives.iter().any(Self::is_missing),
            UnmetReason::Mismatch { .. } | UnmetReason::Negated => false,
        }
    }
}

impl fmt::Display for UnmetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmetReason::MissingReference { reference, detail } => {
                write!(f, "{reference} unavailable: {detail}")
            }
            UnmetReason::Mismatch {
                reference,
                actual,
                op,
                expected,
            } => write!(f, "{reference} = {actual}, expected {op} {expected}"),
            UnmetReason::NotSucceeded { task, status } => match status {
                Some(status) => write!(f, "task {task} is {status}"),
                None => write!(f, "task {task} has no result"),
            },
            UnmetReason::NoneHeld { alternatives } => {
                let parts: Vec<String> = alternatives.iter().map(ToString::to_string).collect();
                write!(f, "no alternative held ({})", parts.join("; "))
            }
            UnmetReason::Negated => f.write_str("negated condition held"),
        }
    }
}

/// A criterion that did not hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnmetCriterion {
    pub criterion: String,
    pub severity: Severity,
    pub reason: UnmetReason,
}

/// Result of evaluating a set of criteria.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CriteriaReport {
    /// Ids of criteria that applied at the configured level
    pub evaluated: Vec<String>,
    /// Criteria that did not hold, in declaration order
    pub unmet: Vec<UnmetCriterion>,
}

impl CriteriaReport {
    /// Returns true if no hard criterion is unmet.
    pub fn is_met(&self) -> bool {
        self.hard_unmet().next().is_none()
    }

    /// Unmet hard criteria.
    pub fn hard_unmet(&self) -> impl Iterator<Item = &UnmetCriterion> {
        self.unmet.iter().filter(|u| u.severity == Severity::Hard)
    }

    /// Unmet soft criteria.
    pub fn soft_unmet(&self) -> impl Iterator<Item = &UnmetCriterion> {
        self.unmet.iter().filter(|u| u.severity == Severity::Soft)
    }
}

/// Evaluates every criterion applicable at `level` against `context`.
///
/// # Example
///
/// ```
/// use relay_agent::workflow::criteria::{evaluate, CompareOp, Predicate, SuccessCriterion};
/// use relay_agent::workflow::config::VerificationLevel;
/// use relay_core::{ContextStore, TaskResult};
/// use serde_json::json;
///
/// let store = ContextStore::new();
/// store.record(TaskResult::succeeded("tests", 1, json!({ "coverage": 85 }), None)).unwrap();
///
/// let coverage = SuccessCriterion::new(
///     "coverage",
///     Predicate::compare("tests", "coverage".parse().unwrap(), CompareOp::Ge, json!(80)),
/// );
/// let report = evaluate(&[coverage], &store, VerificationLevel::Standard);
/// assert!(report.is_met());
/// ```
pub fn evaluate(
    criteria: &[SuccessCriterion],
    context: &ContextStore,
    level: VerificationLevel,
) -> CriteriaReport {
    let mut report = CriteriaReport::default();
    for criterion in criteria.iter().filter(|c| c.applies_at(level)) {
        report.evaluated.push(criterion.id.clone());
        if let Err(reason) = criterion.predicate.check(context) {
            report.unmet.push(UnmetCriterion {
                criterion: criterion.id.clone(),
                severity: criterion.severity,
                reason,
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{TaskError, TaskResult};
    use serde_json::json;

    fn path(s: &str) -> FieldPath {
        s.parse().unwrap()
    }

    fn store() -> ContextStore {
        let store = ContextStore::new();
        store
            .record(TaskResult::succeeded(
                "tests",
                1,
                json!({ "coverage": 85, "status": "green" }),
                None,
            ))
            .unwrap();
        store
            .record(TaskResult::failed(
                "lint",
                1,
                TaskError::Timeout { timeout_ms: 1 },
                None,
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_compare_ops() {
        let store = store();
        let check = |op, value| {
            Predicate::compare("tests", path("coverage"), op, value)
                .check(&store)
                .is_ok()
        };
        assert!(check(CompareOp::Ge, json!(80)));
        assert!(check(CompareOp::Ge, json!(85.0)));
        assert!(check(CompareOp::Eq, json!(85.0)));
        assert!(!check(CompareOp::Gt, json!(85)));
        assert!(check(CompareOp::Lt, json!(90)));
        assert!(check(CompareOp::Ne, json!(84)));
        assert!(!check(CompareOp::Ge, json!("80")));
    }

    #[test]
    fn test_missing_reference_is_unmet_not_panic() {
        let store = store();
        let reason = Predicate::compare("ghost", path("coverage"), CompareOp::Ge, json!(80))
            .check(&store)
            .unwrap_err();
        assert!(matches!(reason, UnmetReason::MissingReference { .. }));

        let failed_task = Predicate::Exists {
            task: TaskId::new("lint"),
            path: path("errors"),
        };
        assert!(failed_task.check(&store).is_err());
    }

    #[test]
    fn test_combinators() {
        let store = store();
        let green = Predicate::compare("tests", path("status"), CompareOp::Eq, json!("green"));
        let lint_ok = Predicate::Succeeded {
            task: TaskId::new("lint"),
        };

        assert!(Predicate::Any(vec![lint_ok.clone(), green.clone()])
            .check(&store)
            .is_ok());
        assert!(Predicate::All(vec![green.clone(), lint_ok.clone()])
            .check(&store)
            .is_err());
        assert!(Predicate::Not(Box::new(lint_ok.clone())).check(&store).is_ok());
        assert_eq!(
            Predicate::Not(Box::new(green)).check(&store),
            Err(UnmetReason::Negated)
        );
        assert!(matches!(
            Predicate::Any(vec![lint_ok]).check(&store),
            Err(UnmetReason::NoneHeld { .. })
        ));
    }

    #[test]
    fn test_not_over_skipped_task_stays_unmet() {
        let store = ContextStore::new();
        store.record(TaskResult::skipped("tests")).unwrap();

        let no_failures = SuccessCriterion::new(
            "no-failures",
            Predicate::Not(Box::new(Predicate::compare(
                "tests",
                path("failed"),
                CompareOp::Gt,
                json!(0),
            ))),
        );
        let report = evaluate(&[no_failures], &store, VerificationLevel::Standard);
        assert_eq!(report.unmet.len(), 1);
        assert!(matches!(
            report.unmet[0].reason,
            UnmetReason::MissingReference { .. }
        ));

        // Unknown task: no status to negate.
        let ghost = Predicate::Not(Box::new(Predicate::Succeeded {
            task: TaskId::new("ghost"),
        }));
        assert!(ghost.check(&store).is_err());

        // A recorded skip is a real answer to "succeeded".
        let not_succeeded = Predicate::Not(Box::new(Predicate::Succeeded {
            task: TaskId::new("tests"),
        }));
        assert!(not_succeeded.check(&store).is_ok());
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let store = ContextStore::new();
        store
            .record(TaskResult::succeeded(
                "build",
                1,
                json!({ "id": 9_007_199_254_740_993u64, "offset": -1 }),
                None,
            ))
            .unwrap();
        let check = |field: &str, op, value| {
            Predicate::compare("build", path(field), op, value)
                .check(&store)
                .is_ok()
        };

        assert!(!check("id", CompareOp::Eq, json!(9_007_199_254_740_992u64)));
        assert!(check("id", CompareOp::Gt, json!(9_007_199_254_740_992u64)));
        assert!(check("id", CompareOp::Eq, json!(9_007_199_254_740_993u64)));
        assert!(check("offset", CompareOp::Lt, json!(u64::MAX)));
        assert!(check("offset", CompareOp::Eq, json!(-1.0)));
    }

    #[test]
    fn test_evaluate_severity_and_level() {
        let store = store();
        let criteria = vec![
            SuccessCriterion::new(
                "coverage",
                Predicate::compare("tests", path("coverage"), CompareOp::Ge, json!(90)),
            )
            .soft(),
            SuccessCriterion::new(
                "lint",
                Predicate::Succeeded {
                    task: TaskId::new("lint"),
                },
            )
            .at_level(VerificationLevel::Strict),
        ];

        let standard = evaluate(&criteria, &store, VerificationLevel::Standard);
        assert_eq!(standard.evaluated, vec!["coverage".to_string()]);
        assert_eq!(standard.soft_unmet().count(), 1);
        assert!(standard.is_met());

        let strict = evaluate(&criteria, &store, VerificationLevel::Strict);
        assert_eq!(strict.unmet.len(), 2);
        assert!(!strict.is_met());
        assert_eq!(strict.hard_unmet().next().unwrap().criterion, "lint");
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let store = store();
        let criteria = vec![
            SuccessCriterion::new(
                "coverage",
                Predicate::compare("tests", path("coverage"), CompareOp::Ge, json!(80)),
            ),
            SuccessCriterion::new(
                "ghost",
                Predicate::Exists {
                    task: TaskId::new("ghost"),
                    path: path("x"),
                },
            ),
        ];
        let first = evaluate(&criteria, &store, VerificationLevel::Standard);
        let second = evaluate(&criteria, &store, VerificationLevel::Standard);
        assert_eq!(first, second);
        assert_eq!(first.unmet.len(), 1);
    }

    #[test]
    fn test_referenced_tasks() {
        let predicate = Predicate::All(vec![
            Predicate::Succeeded {
                task: TaskId::new("a"),
            },
            Predicate::Not(Box::new(Predicate::Exists {
                task: TaskId::new("b"),
                path: path("x"),
            })),
        ]);
        assert_eq!(
            predicate.referenced_tasks(),
            vec![&TaskId::new("a"), &TaskId::new("b")]
        );
    }

    #[test]
    fn test_reason_display() {
        let reason = UnmetReason::Mismatch {
            reference: "tests.coverage".into(),
            actual: json!(70),
            op: CompareOp::Ge,
            expected: json!(80),
        };
        assert_eq!(reason.to_string(), "tests.coverage = 70, expected >= 80");
    }
}
