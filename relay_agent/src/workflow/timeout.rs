//! Timeout configuration for task attempts, workflow runs and rollback.
//!
//! All timeouts serialize as whole milliseconds so they can be written
//! directly in workflow documents (`timeout_ms: 5000`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Maximum wall-clock duration of one task attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskTimeout(Duration);

impl TaskTimeout {
    /// Creates a new TaskTimeout with the specified duration.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_agent::workflow::timeout::TaskTimeout;
    /// use std::time::Duration;
    ///
    /// let timeout = TaskTimeout::new(Duration::from_secs(30));
    /// assert_eq!(timeout, TaskTimeout::default());
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Creates a TaskTimeout from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Creates a TaskTimeout from milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Returns the timeout duration.
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Returns the timeout in whole milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }
}

impl Default for TaskTimeout {
    /// Default timeout is 30 seconds.
    fn default() -> Self {
        Self(Duration::from_secs(30))
    }
}

impl Serialize for TaskTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_millis(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for TaskTimeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_millis(deserializer).map(Self)
    }
}

/// Maximum wall-clock duration of a whole run.
///
/// When the limit elapses the run is cancelled; rollback still runs
/// under its own [`RollbackTimeout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkflowTimeout(Duration);

impl WorkflowTimeout {
    /// Creates a new WorkflowTimeout with the specified duration.
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Creates a WorkflowTimeout from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Creates a WorkflowTimeout from milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Returns the timeout duration.
    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl Default for WorkflowTimeout {
    /// Default timeout is 5 minutes.
    fn default() -> Self {
        Self(Duration::from_secs(300))
    }
}

impl Serialize for WorkflowTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_millis(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowTimeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_millis(deserializer).map(Self)
    }
}

/// Bounds for the rollback executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RollbackTimeout {
    /// Default limit for a single compensation step
    #[serde(
        rename = "step_ms",
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub step: Duration,
    /// Cap on the whole rollback; steps not started before it are abandoned
    #[serde(
        rename = "total_ms",
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub total: Duration,
}

impl RollbackTimeout {
    /// Creates rollback bounds.
    pub fn new(step: Duration, total: Duration) -> Self {
        Self { step, total }
    }
}

impl Default for RollbackTimeout {
    /// 30 seconds per step, 5 minutes in total.
    fn default() -> Self {
        Self {
            step: Duration::from_secs(30),
            total: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_timeout_defaults_and_ctors() {
        assert_eq!(TaskTimeout::default().duration(), Duration::from_secs(30));
        assert_eq!(TaskTimeout::from_secs(2).as_millis(), 2000);
        assert_eq!(
            TaskTimeout::from_millis(250).duration(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_workflow_timeout_default() {
        assert_eq!(
            WorkflowTimeout::default().duration(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_timeouts_serialize_as_millis() {
        let json = serde_json::to_string(&TaskTimeout::from_secs(5)).unwrap();
        assert_eq!(json, "5000");

        let back: WorkflowTimeout = serde_json::from_str("1500").unwrap();
        assert_eq!(back.duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_rollback_timeout_partial_document() {
        let parsed: RollbackTimeout = serde_json::from_str(r#"{"step_ms": 100}"#).unwrap();
        assert_eq!(parsed.step, Duration::from_millis(100));
        assert_eq!(parsed.total, Duration::from_secs(300));

        assert!(serde_json::from_str::<RollbackTimeout>(r#"{"steps": 1}"#).is_err());
    }
}
