//! RelayKit core - shared model for the workflow orchestration engine.
//!
//! This crate holds the types every other RelayKit crate agrees on:
//!
//! - **Identifiers**: [`TaskId`], [`PhaseId`], [`WorkerId`] and [`RunId`]
//! - **Results**: [`TaskStatus`] and [`TaskResult`], one per task attempt
//! - **Errors**: the task-level taxonomy [`TaskError`] and its [`ErrorKind`]
//! - **Context store**: [`ContextStore`], the append-only record of task
//!   results that flows between tasks of one workflow run
//!
//! # Quick Start
//!
//! ```rust
//! use relay_core::{ContextStore, TaskResult, TaskId};
//! use serde_json::json;
//!
//! let store = ContextStore::new();
//! store
//!     .record(TaskResult::succeeded("tests", 1, json!({ "coverage": 85 }), None))
//!     .unwrap();
//!
//! let coverage = store.lookup(&TaskId::new("tests"), &"coverage".parse().unwrap()).unwrap();
//! assert_eq!(coverage, json!(85));
//! ```
//!
//! # Modules
//!
//! - [`types`]: identifiers, statuses and task results
//! - [`error`]: error types for task execution and store access
//! - [`path`]: dotted field paths into JSON payloads
//! - [`context`]: the shared context store

pub mod context;
pub mod error;
pub mod path;
pub mod types;

// Re-export commonly used types
pub use context::ContextStore;
pub use error::{ContextError, ErrorKind, LookupError, TaskError};
pub use path::{FieldPath, PathError};
pub use types::{Payload, PhaseId, RunId, TaskId, TaskResult, TaskStatus, WorkerId};
