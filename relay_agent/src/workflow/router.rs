//! Worker selection.
//!
//! A task names its worker either statically or through a [`Router`]. A
//! router chooses among a finite, declared candidate set by inspecting the
//! run's context store at dispatch time, e.g. "send the fix to the worker for
//! the language the detector reported".

use relay_core::{ContextStore, FieldPath, Payload, TaskError, TaskId, WorkerId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Closure form of a routing rule.
pub type RouteFn = Arc<dyn Fn(&ContextStore) -> Option<WorkerId> + Send + Sync>;

/// How a router picks a worker.
#[derive(Clone)]
pub enum RouteRule {
    /// Compare a field of an upstream task's output against fixed values
    Match {
        task: TaskId,
        path: FieldPath,
        routes: Vec<(Payload, WorkerId)>,
        fallback: Option<WorkerId>,
    },
    /// Arbitrary selection logic; `None` means no route matched
    Function(RouteFn),
}

impl fmt::Debug for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteRule::Match {
                task,
                path,
                routes,
                fallback,
            } => f
                .debug_struct("Match")
                .field("task", task)
                .field("path", path)
                .field("routes", routes)
                .field("fallback", fallback)
                .finish(),
            RouteRule::Function(_) => f.write_str("Function(<fn>)"),
        }
    }
}

/// Data-dependent worker selection over a closed candidate set.
#[derive(Clone, Debug)]
pub struct Router {
    name: String,
    candidates: BTreeSet<WorkerId>,
    rule: RouteRule,
}

impl Router {
    /// Routes on the value at `path` in `task`'s output.
    ///
    /// The candidate set is every route target plus the fallback.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let router = Router::matching("by-language", "detect", "language".parse()?)
    ///     .route(json!("rust"), "rust-fixer")
    ///     .route(json!("python"), "python-fixer")
    ///     .fallback("generic-fixer");
    /// ```
    pub fn matching(name: impl Into<String>, task: impl Into<TaskId>, path: FieldPath) -> Self {
        Self {
            name: name.into(),
            candidates: BTreeSet::new(),
            rule: RouteRule::Match {
                task: task.into(),
                path,
                routes: Vec::new(),
                fallback: None,
            },
        }
    }

    /// Routes through a closure restricted to `candidates`.
    pub fn function<I, W, F>(name: impl Into<String>, candidates: I, f: F) -> Self
    where
        I: IntoIterator<Item = W>,
        W: Into<WorkerId>,
        F: Fn(&ContextStore) -> Option<WorkerId> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            candidates: candidates.into_iter().map(Into::into).collect(),
            rule: RouteRule::Function(Arc::new(f)),
        }
    }

    /// Adds a `value -> worker` route to a matching router.
    pub fn route(mut self, value: Payload, worker: impl Into<WorkerId>) -> Self {
        let worker = worker.into();
        if let RouteRule::Match { routes, .. } = &mut self.rule {
            self.candidates.insert(worker.clone());
            routes.push((value, worker));
        }
        self
    }

    /// Sets the worker used when no route matches.
    pub fn fallback(mut self, worker: impl Into<WorkerId>) -> Self {
        let worker = worker.into();
        if let RouteRule::Match { fallback, .. } = &mut self.rule {
            self.candidates.insert(worker.clone());
            *fallback = Some(worker);
        }
        self
    }

    /// Router name, used in errors and audit records.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workers this router may select.
    pub fn candidates(&self) -> &BTreeSet<WorkerId> {
        &self.candidates
    }

    /// Routing rule.
    pub fn rule(&self) -> &RouteRule {
        &self.rule
    }

    /// Upstream task the rule reads, for matching routers.
    pub fn upstream(&self) -> Option<&TaskId> {
        match &self.rule {
            RouteRule::Match { task, .. } => Some(task),
            RouteRule::Function(_) => None,
        }
    }

    /// Selects a worker for the current context.
    ///
    /// # Errors
    ///
    /// [`TaskError::NoRouteMatched`] if nothing matches and there is no
    /// fallback, or if the selection lies outside the candidate set.
    pub fn resolve(&self, context: &ContextStore) -> Result<WorkerId, TaskError> {
        let selected = match &self.rule {
            RouteRule::Match {
                task,
                path,
                routes,
                fallback,
            } => match context.lookup(task, path) {
                Ok(value) => routes
                    .iter()
                    .find(|(candidate, _)| *candidate == value)
                    .map(|(_, worker)| worker.clone())
                    .or_else(|| fallback.clone())
                    .ok_or_else(|| self.no_match(format!("no route for value {value}")))?,
                Err(e) => fallback
                    .clone()
                    .ok_or_else(|| self.no_match(e.to_string()))?,
            },
            RouteRule::Function(f) => {
                f(context).ok_or_else(|| self.no_match("rule selected no worker".to_string()))?
            }
        };

        if !self.candidates.contains(&selected) {
            return Err(self.no_match(format!(
                "selected worker {selected} is not a declared candidate"
            )));
        }
        Ok(selected)
    }

    fn no_match(&self, detail: String) -> TaskError {
        TaskError::NoRouteMatched {
            router: self.name.clone(),
            detail,
        }
    }
}

/// Worker reference of a task.
#[derive(Clone, Debug)]
pub enum WorkerRef {
    /// Fixed worker
    Static(WorkerId),
    /// Worker chosen at dispatch time
    Routed(Router),
}

impl WorkerRef {
    /// Every worker this reference can resolve to.
    pub fn possible_workers(&self) -> Vec<WorkerId> {
        match self {
            WorkerRef::Static(worker) => vec![worker.clone()],
            WorkerRef::Routed(router) => router.candidates().iter().cloned().collect(),
        }
    }

    /// Resolves the reference against the current context.
    pub fn resolve(&self, context: &ContextStore) -> Result<WorkerId, TaskError> {
        match self {
            WorkerRef::Static(worker) => Ok(worker.clone()),
            WorkerRef::Routed(router) => router.resolve(context),
        }
    }
}

impl From<WorkerId> for WorkerRef {
    fn from(worker: WorkerId) -> Self {
        WorkerRef::Static(worker)
    }
}

impl From<&str> for WorkerRef {
    fn from(worker: &str) -> Self {
        WorkerRef::Static(WorkerId::new(worker))
    }
}

impl From<Router> for WorkerRef {
    fn from(router: Router) -> Self {
        WorkerRef::Routed(router)
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRef::Static(worker) => write!(f, "{worker}"),
            WorkerRef::Routed(router) => write!(f, "router:{}", router.name()),
        }
    }
}
