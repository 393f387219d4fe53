//! RelayKit agent layer - phased workflow orchestration over external workers.
//!
//! This crate executes workflow definitions:
//!
//! - Definition: phases of tasks, configuration, success criteria and a
//!   rollback plan, built in code or loaded from YAML
//! - Validation: cycles, unknown references and bad configuration are
//!   rejected before any task starts
//! - Execution: tasks are dispatched to registered workers with retry,
//!   timeouts and cancellation
//! - Verification: success criteria are evaluated against the final results
//! - Compensation: succeeded tasks are rolled back when a run fails
//! - Audit: every transition is appended to a hash-chained, replayable log
//!
//! See [`workflow`] for the engine and [`audit`] for the audit trail.

pub mod audit;
pub mod workflow;

pub use audit::{verify_chain, AuditError, AuditEvent, AuditLog, AuditRecord, RunHistory};
pub use workflow::{
    Orchestrator, RunOutcome, RunSnapshot, RunStatus, WorkflowBuilder, WorkflowDefinition,
    WorkflowError, WorkflowRun,
};
