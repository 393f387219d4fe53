//! Task descriptors.

use crate::workflow::retry::RetryPolicy;
use crate::workflow::router::WorkerRef;
use crate::workflow::template::InputTemplate;
use crate::workflow::timeout::TaskTimeout;
use relay_core::TaskId;

/// Static definition of one unit of work.
///
/// Created when a workflow definition is built or loaded and never mutated
/// afterwards. Fields left unset fall back to the workflow configuration.
///
/// # Example
///
/// ```ignore
/// let task = TaskDescriptor::new("tests", "run-tests")
///     .depends_on("build")
///     .with_input(json!({ "artifact": "{{build.path}}" }))
///     .with_timeout(TaskTimeout::from_secs(120));
/// ```
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
    /// Unique id within the workflow
    pub id: TaskId,
    /// Human-readable name
    pub name: String,
    /// Tasks whose results must exist before this task starts
    pub depends_on: Vec<TaskId>,
    /// Produces the worker input from the context
    pub input: InputTemplate,
    /// Worker executing the task
    pub worker: WorkerRef,
    /// Overrides the configured default retry policy
    pub retry: Option<RetryPolicy>,
    /// Overrides the configured default attempt timeout
    pub timeout: Option<TaskTimeout>,
    /// Terminal failure of this task does not fail its phase
    pub allow_failure: bool,
}

impl TaskDescriptor {
    /// Creates a task executed by `worker`, named after its id.
    pub fn new(id: impl Into<TaskId>, worker: impl Into<WorkerRef>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            depends_on: Vec::new(),
            input: InputTemplate::empty(),
            worker: worker.into(),
            retry: None,
            timeout: None,
            allow_failure: false,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a dependency.
    pub fn depends_on(mut self, task: impl Into<TaskId>) -> Self {
        let task = task.into();
        if !self.depends_on.contains(&task) {
            self.depends_on.push(task);
        }
        self
    }

    /// Sets the input template.
    pub fn with_input(mut self, input: impl Into<InputTemplate>) -> Self {
        self.input = input.into();
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the attempt timeout.
    pub fn with_timeout(mut self, timeout: TaskTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the task as non-fatal.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::WorkerId;
    use serde_json::json;

    #[test]
    fn test_builder_methods() {
        let task = TaskDescriptor::new("tests", "runner")
            .with_name("Run tests")
            .depends_on("build")
            .depends_on("build")
            .depends_on("lint")
            .with_input(json!({ "x": 1 }))
            .with_retry(RetryPolicy::new(5))
            .with_timeout(TaskTimeout::from_secs(1))
            .allow_failure();

        assert_eq!(task.id, TaskId::new("tests"));
        assert_eq!(task.name, "Run tests");
        assert_eq!(task.depends_on, vec![TaskId::new("build"), TaskId::new("lint")]);
        assert_eq!(task.retry.as_ref().map(|r| r.max_attempts), Some(5));
        assert!(task.allow_failure);
        assert_eq!(task.worker.possible_workers(), vec![WorkerId::new("runner")]);
    }

    #[test]
    fn test_defaults() {
        let task = TaskDescriptor::new("a", "w");
        assert_eq!(task.name, "a");
        assert!(task.depends_on.is_empty());
        assert!(task.retry.is_none());
        assert!(task.timeout.is_none());
        assert!(!task.allow_failure);
    }
}
