//! Worker boundary.
//!
//! A [`Worker`] is the external collaborator that performs a task: it takes a
//! resolved input payload and returns an output payload or a failure. Workers
//! are registered by id in a [`WorkerRegistry`]; the [`WorkerInvoker`] looks
//! them up and enforces the per-attempt timeout and run cancellation.

use crate::workflow::cancellation::CancellationToken;
use async_trait::async_trait;
use relay_core::{Payload, RunId, TaskError, TaskId, WorkerId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;

/// Failure reported by a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WorkerFailure {
    /// Machine-readable code, matched by code-based retry policies
    pub code: Option<String>,
    /// Human-readable description
    pub message: String,
}

impl WorkerFailure {
    /// Creates a failure without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Creates a failure with a code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for WorkerFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Metadata handed to a worker with each invocation.
#[derive(Clone, Debug)]
pub struct InvocationContext {
    /// Run the invocation belongs to
    pub run_id: RunId,
    /// Task being executed; `None` for compensation steps
    pub task_id: Option<TaskId>,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Time budget of this attempt
    pub timeout: Duration,
    /// Run cancellation; workers doing long work may observe it directly
    pub cancellation: CancellationToken,
}

/// External worker that executes tasks.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Executes one invocation.
    ///
    /// # Arguments
    ///
    /// * `input` - Resolved task input
    /// * `ctx` - Invocation metadata
    ///
    /// # Returns
    ///
    /// The worker's output payload, or a [`WorkerFailure`].
    async fn invoke(&self, input: Payload, ctx: &InvocationContext)
        -> Result<Payload, WorkerFailure>;
}

type WorkerFuture = Pin<Box<dyn Future<Output = Result<Payload, WorkerFailure>> + Send>>;

/// Worker backed by an async closure.
///
/// # Example
///
/// ```ignore
/// let echo = FunctionWorker::new(|input, _ctx| async move { Ok(input) });
/// ```
pub struct FunctionWorker {
    f: Box<dyn Fn(Payload, InvocationContext) -> WorkerFuture + Send + Sync>,
}

impl FunctionWorker {
    /// Creates a worker from an async function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Payload, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, WorkerFailure>> + Send + 'static,
    {
        Self {
            f: Box::new(move |input, ctx| Box::pin(f(input, ctx)) as WorkerFuture),
        }
    }
}

#[async_trait]
impl Worker for FunctionWorker {
    async fn invoke(
        &self,
        input: Payload,
        ctx: &InvocationContext,
    ) -> Result<Payload, WorkerFailure> {
        (self.f)(input, ctx.clone()).await
    }
}

/// Errors from registering workers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerRegistryError {
    /// A worker with this id is already registered
    #[error("worker {0} is already registered")]
    Duplicate(WorkerId),
}

/// Workers available to a runtime, by id.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker under an id.
    pub fn register(
        &mut self,
        id: impl Into<WorkerId>,
        worker: impl Worker + 'static,
    ) -> Result<(), WorkerRegistryError> {
        self.register_arc(id, Arc::new(worker))
    }

    /// Registers an already shared worker under an id.
    pub fn register_arc(
        &mut self,
        id: impl Into<WorkerId>,
        worker: Arc<dyn Worker>,
    ) -> Result<(), WorkerRegistryError> {
        let id = id.into();
        if self.workers.contains_key(&id) {
            return Err(WorkerRegistryError::Duplicate(id));
        }
        self.workers.insert(id, worker);
        Ok(())
    }

    /// Builder-style registration; replaces any worker with the same id.
    pub fn with_worker(mut self, id: impl Into<WorkerId>, worker: impl Worker + 'static) -> Self {
        self.workers.insert(id.into(), Arc::new(worker));
        self
    }

    /// Returns the worker registered under `id`.
    pub fn get(&self, id: &WorkerId) -> Option<Arc<dyn Worker>> {
        self.workers.get(id).cloned()
    }

    /// Returns true if `id` is registered.
    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Aborts the wrapped task when dropped.
pub(crate) struct AbortOnDrop(pub(crate) AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Invokes registered workers under a timeout and a cancellation token.
#[derive(Clone, Default)]
pub struct WorkerInvoker {
    registry: Arc<WorkerRegistry>,
}

impl WorkerInvoker {
    /// Creates an invoker over a registry.
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Invokes `worker` with `input`.
    ///
    /// The call runs as its own tokio task so a panicking worker surfaces as
    /// a worker error. When the timeout elapses or the token in `ctx` is
    /// cancelled, the call is aborted and `Timeout` or `Cancelled` returned.
    pub async fn invoke(
        &self,
        worker_id: &WorkerId,
        input: Payload,
        ctx: InvocationContext,
    ) -> Result<Payload, TaskError> {
        let worker = self.registry.get(worker_id).ok_or_else(|| TaskError::Worker {
            worker: worker_id.to_string(),
            code: Some("unknown_worker".to_string()),
            message: format!("no worker registered as {worker_id}"),
        })?;

        let timeout = ctx.timeout;
        let cancellation = ctx.cancellation.clone();
        if cancellation.is_cancelled() {
            return Err(cancelled_error(&cancellation));
        }

        let mut handle = tokio::spawn(async move { worker.invoke(input, &ctx).await });
        let _guard = AbortOnDrop(handle.abort_handle());

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(cancelled_error(&cancellation)),
            joined = tokio::time::timeout(timeout, &mut handle) => match joined {
                Err(_) => Err(TaskError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
                Ok(Err(join_err)) => Err(TaskError::Worker {
                    worker: worker_id.to_string(),
                    code: Some("panic".to_string()),
                    message: format!("worker task aborted: {join_err}"),
                }),
                Ok(Ok(Err(failure))) => Err(TaskError::Worker {
                    worker: worker_id.to_string(),
                    code: failure.code,
                    message: failure.message,
                }),
                Ok(Ok(Ok(output))) => Ok(output),
            },
        }
    }
}

fn cancelled_error(token: &CancellationToken) -> TaskError {
    TaskError::Cancelled {
        reason: token.reason().unwrap_or_else(|| "cancelled".to_string()),
    }
}
