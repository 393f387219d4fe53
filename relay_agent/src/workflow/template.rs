//! Input templates.
//!
//! A task's input is produced from a template at dispatch time. The usual
//! form is a JSON tree whose strings may contain `{{ ref }}` placeholders:
//!
//! - `{{ <task-id>.<path> }}` reads a field of an upstream task's output
//!   (`{{ <task-id> }}` reads the whole output)
//! - `{{ args.<path> }}` reads the run's argument payload
//! - `{{ config.<field> }}` reads a workflow configuration option
//!
//! A string consisting of exactly one placeholder is replaced by the
//! referenced value with its JSON type preserved. Placeholders embedded in
//! longer strings are interpolated as text.

use crate::workflow::config::WorkflowConfig;
use relay_core::{ContextStore, FieldPath, Payload, PathError, TaskError, TaskId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Task ids reserved for template namespaces.
pub const RESERVED_IDS: &[&str] = &["args", "config"];

/// Error parsing a template placeholder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// `{{` without a matching `}}`
    #[error("unclosed placeholder in {0:?}")]
    Unclosed(String),

    /// `{{ }}` with nothing inside
    #[error("empty placeholder in {0:?}")]
    EmptyReference(String),

    /// Placeholder path did not parse
    #[error("invalid reference {reference:?}: {source}")]
    InvalidPath {
        reference: String,
        #[source]
        source: PathError,
    },

    /// `config.<a>.<b>` or bare `config`
    #[error("config reference {0:?} must name exactly one field")]
    InvalidConfigReference(String),
}

/// A parsed placeholder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    /// Field of an upstream task's output
    Task { task: TaskId, path: FieldPath },
    /// Workflow configuration option
    Config(String),
    /// Field of the run arguments
    Args(FieldPath),
}

impl Reference {
    /// Parses the text between `{{` and `}}`.
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TemplateError::EmptyReference(text.to_string()));
        }
        let path: FieldPath = text.parse().map_err(|source| TemplateError::InvalidPath {
            reference: text.to_string(),
            source,
        })?;
        let head = path.first().unwrap_or_default();
        let rest = path.tail();
        match head {
            "args" => Ok(Reference::Args(rest)),
            "config" => match rest.segments() {
                [field] => Ok(Reference::Config(field.clone())),
                _ => Err(TemplateError::InvalidConfigReference(text.to_string())),
            },
            task => Ok(Reference::Task {
                task: TaskId::new(task),
                path: rest,
            }),
        }
    }

    /// Returns the upstream task this reference reads, if any.
    pub fn task(&self) -> Option<&TaskId> {
        match self {
            Reference::Task { task, .. } => Some(task),
            _ => None,
        }
    }

    fn resolve(&self, scope: &ResolveScope<'_>) -> Result<Payload, TaskError> {
        let unresolved = || TaskError::UnresolvedReference {
            reference: self.to_string(),
        };
        match self {
            Reference::Task { task, path } => {
                scope.context.lookup(task, path).map_err(|_| unresolved())
            }
            Reference::Config(field) => scope.config.lookup(field).ok_or_else(unresolved),
            Reference::Args(path) => path.select(scope.args).cloned().ok_or_else(unresolved),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Task { task, path } if path.is_root() => write!(f, "{task}"),
            Reference::Task { task, path } => write!(f, "{task}.{path}"),
            Reference::Config(field) => write!(f, "config.{field}"),
            Reference::Args(path) if path.is_root() => f.write_str("args"),
            Reference::Args(path) => write!(f, "args.{path}"),
        }
    }
}

/// Everything a template can read at dispatch time.
#[derive(Clone, Copy)]
pub struct ResolveScope<'a> {
    pub context: &'a ContextStore,
    pub config: &'a WorkflowConfig,
    pub args: &'a Payload,
}

/// Closure form of an input template.
pub type TemplateFn = Arc<dyn Fn(&ResolveScope<'_>) -> Result<Payload, TaskError> + Send + Sync>;

/// Produces a task's input from the run's context.
#[derive(Clone)]
pub enum InputTemplate {
    /// JSON tree with `{{ }}` placeholders
    Value(Payload),
    /// Arbitrary resolution logic
    Function(TemplateFn),
}

impl InputTemplate {
    /// Template producing `null`.
    pub fn empty() -> Self {
        InputTemplate::Value(Payload::Null)
    }

    /// Wraps a closure as a template.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&ResolveScope<'_>) -> Result<Payload, TaskError> + Send + Sync + 'static,
    {
        InputTemplate::Function(Arc::new(f))
    }

    /// Lists every placeholder in the template.
    ///
    /// Closure templates cannot be inspected and report no references; their
    /// upstream tasks must be declared through `depends_on`.
    pub fn references(&self) -> Result<Vec<Reference>, TemplateError> {
        let mut refs = Vec::new();
        if let InputTemplate::Value(value) = self {
            collect_references(value, &mut refs)?;
        }
        Ok(refs)
    }

    /// Resolves the template against the run's context.
    ///
    /// # Errors
    ///
    /// [`TaskError::UnresolvedReference`] if any placeholder names a task
    /// without output, a missing field, or an unknown option.
    pub fn resolve(&self, scope: &ResolveScope<'_>) -> Result<Payload, TaskError> {
        match self {
            InputTemplate::Value(value) => resolve_value(value, scope),
            InputTemplate::Function(f) => f(scope),
        }
    }
}

impl Default for InputTemplate {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Payload> for InputTemplate {
    fn from(value: Payload) -> Self {
        InputTemplate::Value(value)
    }
}

impl fmt::Debug for InputTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputTemplate::Value(value) => f.debug_tuple("Value").field(value).finish(),
            InputTemplate::Function(_) => f.write_str("Function(<fn>)"),
        }
    }
}

/// Piece of a template string.
enum Segment<'a> {
    Text(&'a str),
    Placeholder(Reference),
}

fn split_segments(s: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or_else(|| TemplateError::Unclosed(s.to_string()))?;
        let inner = &after_open[..end];
        if inner.trim().is_empty() {
            return Err(TemplateError::EmptyReference(s.to_string()));
        }
        segments.push(Segment::Placeholder(Reference::parse(inner)?));
        rest = &after_open[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

fn collect_references(value: &Payload, out: &mut Vec<Reference>) -> Result<(), TemplateError> {
    match value {
        Payload::String(s) => {
            for segment in split_segments(s)? {
                if let Segment::Placeholder(reference) = segment {
                    out.push(reference);
                }
            }
        }
        Payload::Array(items) => {
            for item in items {
                collect_references(item, out)?;
            }
        }
        Payload::Object(map) => {
            for item in map.values() {
                collect_references(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_value(value: &Payload, scope: &ResolveScope<'_>) -> Result<Payload, TaskError> {
    match value {
        Payload::String(s) => resolve_string(s, scope),
        Payload::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::Array),
        Payload::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, scope)?);
            }
            Ok(Payload::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, scope: &ResolveScope<'_>) -> Result<Payload, TaskError> {
    // Placeholders were checked at load time; a malformed string here can
    // only come from an unvalidated definition.
    let segments = split_segments(s).map_err(|e| TaskError::UnresolvedReference {
        reference: e.to_string(),
    })?;
    if let [Segment::Placeholder(reference)] = segments.as_slice() {
        return reference.resolve(scope);
    }
    let mut out = String::with_capacity(s.len());
    for segment in &segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Placeholder(reference) => match reference.resolve(scope)? {
                Payload::String(text) => out.push_str(&text),
                other => out.push_str(&other.to_string()),
            },
        }
    }
    Ok(Payload::String(out))
}
