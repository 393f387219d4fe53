//! Shared context store.
//!
//! The [`ContextStore`] holds the final [`TaskResult`] of every task in one
//! workflow run. It is append-only: a task's entry is written once, when the
//! task reaches a terminal status, and never changes afterwards. Entries keep
//! their insertion order, which is the run's completion order and drives
//! rollback ordering.
//!
//! The store is cheap to clone; clones share the same entries, so a run's
//! concurrent tasks can all read and record through their own handle.

use crate::error::{ContextError, LookupError};
use crate::path::FieldPath;
use crate::types::{Payload, TaskId, TaskResult, TaskStatus};
use indexmap::IndexMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// Append-only store of final task results for one run.
#[derive(Clone, Debug, Default)]
pub struct ContextStore {
    entries: Arc<RwLock<IndexMap<TaskId, Arc<TaskResult>>>>,
}

impl ContextStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexMap<TaskId, Arc<TaskResult>>> {
        // Entries are only ever inserted whole, so a poisoned lock still
        // guards consistent data.
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<TaskId, Arc<TaskResult>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the final result of a task.
    ///
    /// # Returns
    ///
    /// The completion index of the entry (0 for the first task to finish).
    ///
    /// # Errors
    ///
    /// - [`ContextError::NotTerminal`] if the result is Pending or Running
    /// - [`ContextError::AlreadyRecorded`] if the task already has an entry
    pub fn record(&self, result: TaskResult) -> Result<usize, ContextError> {
        if !result.status.is_terminal() {
            return Err(ContextError::NotTerminal {
                task: result.task_id,
                status: result.status,
            });
        }
        let mut entries = self.write();
        if entries.contains_key(&result.task_id) {
            return Err(ContextError::AlreadyRecorded(result.task_id));
        }
        let index = entries.len();
        trace!(task = %result.task_id, status = ?result.status, index, "recorded task result");
        entries.insert(result.task_id.clone(), Arc::new(result));
        Ok(index)
    }

    /// Returns the recorded result of a task.
    pub fn get(&self, task: &TaskId) -> Option<Arc<TaskResult>> {
        self.read().get(task).cloned()
    }

    /// Returns the recorded status of a task.
    pub fn status(&self, task: &TaskId) -> Option<TaskStatus> {
        self.read().get(task).map(|r| r.status)
    }

    /// Returns true if the task has a recorded result.
    pub fn contains(&self, task: &TaskId) -> bool {
        self.read().contains_key(task)
    }

    /// Returns true if the task is recorded as Succeeded.
    pub fn is_succeeded(&self, task: &TaskId) -> bool {
        self.status(task) == Some(TaskStatus::Succeeded)
    }

    /// Returns the full output of a succeeded task.
    pub fn output(&self, task: &TaskId) -> Result<Payload, LookupError> {
        let entries = self.read();
        let result = entries
            .get(task)
            .ok_or_else(|| LookupError::MissingTask(task.clone()))?;
        result.output.clone().ok_or_else(|| LookupError::NoOutput {
            task: task.clone(),
            status: result.status,
        })
    }

    /// Reads one field of a succeeded task's output.
    ///
    /// # Arguments
    ///
    /// * `task` - Task whose output is read
    /// * `path` - Dotted path into the output; the root path returns it whole
    pub fn lookup(&self, task: &TaskId, path: &FieldPath) -> Result<Payload, LookupError> {
        let entries = self.read();
        let result = entries
            .get(task)
            .ok_or_else(|| LookupError::MissingTask(task.clone()))?;
        let output = result.output.as_ref().ok_or_else(|| LookupError::NoOutput {
            task: task.clone(),
            status: result.status,
        })?;
        path.select(output)
            .cloned()
            .ok_or_else(|| LookupError::MissingField {
                task: task.clone(),
                path: path.to_string(),
            })
    }

    /// Returns the position of the task in completion order.
    pub fn completion_index(&self, task: &TaskId) -> Option<usize> {
        self.read().get_index_of(task)
    }

    /// Returns task ids in the order their results were recorded.
    pub fn completion_order(&self) -> Vec<TaskId> {
        self.read().keys().cloned().collect()
    }

    /// Returns ids of succeeded tasks in completion order.
    pub fn succeeded_in_completion_order(&self) -> Vec<TaskId> {
        self.read()
            .values()
            .filter(|r| r.is_success())
            .map(|r| r.task_id.clone())
            .collect()
    }

    /// Returns a point-in-time copy of every recorded result.
    pub fn snapshot(&self) -> Vec<TaskResult> {
        self.read().values().map(|r| (**r).clone()).collect()
    }

    /// Number of recorded results.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
