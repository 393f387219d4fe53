//! Dotted field paths into JSON payloads.
//!
//! A path such as `report.files.0.name` walks object keys and, for purely
//! numeric segments, array indices.

use crate::types::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a [`FieldPath`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Path string was empty
    #[error("field path is empty")]
    Empty,

    /// Path contained an empty segment (e.g. `a..b`)
    #[error("field path {0:?} contains an empty segment")]
    EmptySegment(String),
}

/// A dotted path selecting a value inside a payload.
///
/// The empty path is not allowed; use [`FieldPath::root`] for the whole value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// The path selecting the whole payload.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Returns true if this path selects the whole payload.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the first segment, if any.
    pub fn first(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Returns the path without its first segment.
    pub fn tail(&self) -> Self {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// Selects the value at this path, if present.
    pub fn select<'a>(&self, value: &'a Payload) -> Option<&'a Payload> {
        let mut current = value;
        for segment in &self.segments {
            current = match current {
                Payload::Object(map) => map.get(segment)?,
                Payload::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let segments: Vec<String> = s.split('.').map(|seg| seg.trim().to_string()).collect();
        if segments.iter().any(String::is_empty) {
            return Err(PathError::EmptySegment(s.to_string()));
        }
        Ok(Self { segments })
    }
}

impl TryFrom<String> for FieldPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
