//! Runtime metrics for run counts by outcome and run timing.

use relay_agent::workflow::RunStatus;
use relay_agent::RunOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Kind of metric being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Run accepted and started
    RunStarted,
    /// Definition rejected at start
    RunRejected,
    /// Run ended Succeeded
    RunSucceeded,
    /// Run ended Failed without rollback
    RunFailed,
    /// Run ended RolledBack
    RunRolledBack,
    /// Run ended because it was cancelled
    RunCancelled,
}

const KINDS: usize = 6;

/// Runtime metrics collector.
///
/// Clones share the same counters.
#[derive(Clone, Debug)]
pub struct RuntimeMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Counts by kind
    counts: [AtomicU64; KINDS],
    /// Wall time of finished runs (nanoseconds)
    total_time_ns: AtomicU64,
}

impl RuntimeMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                counts: std::array::from_fn(|_| AtomicU64::new(0)),
                total_time_ns: AtomicU64::new(0),
            }),
        }
    }

    /// Records a metric occurrence.
    pub fn record(&self, kind: MetricKind) {
        self.inner.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished run and how long it took.
    ///
    /// A cancelled run counts as cancelled only, whatever its final status.
    pub fn record_outcome(&self, outcome: &RunOutcome, duration: Duration) {
        let kind = if outcome.was_cancelled() {
            MetricKind::RunCancelled
        } else {
            match outcome.status {
                RunStatus::Succeeded => MetricKind::RunSucceeded,
                RunStatus::RolledBack => MetricKind::RunRolledBack,
                _ => MetricKind::RunFailed,
            }
        };
        self.record(kind);
        self.inner
            .total_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Gets the count for a specific metric.
    pub fn count(&self, kind: MetricKind) -> u64 {
        self.inner.counts[kind as usize].load(Ordering::Relaxed)
    }

    /// Gets the total run time.
    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.inner.total_time_ns.load(Ordering::Relaxed))
    }

    /// Number of runs that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.count(MetricKind::RunSucceeded)
            + self.count(MetricKind::RunFailed)
            + self.count(MetricKind::RunRolledBack)
            + self.count(MetricKind::RunCancelled)
    }

    /// Gets the success rate of finished runs (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        let finished = self.finished();
        if finished == 0 {
            return 0.0;
        }
        self.count(MetricKind::RunSucceeded) as f64 / finished as f64
    }

    /// Gets all metrics as a summary.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            started: self.count(MetricKind::RunStarted),
            rejected: self.count(MetricKind::RunRejected),
            succeeded: self.count(MetricKind::RunSucceeded),
            failed: self.count(MetricKind::RunFailed),
            rolled_back: self.count(MetricKind::RunRolledBack),
            cancelled: self.count(MetricKind::RunCancelled),
            total_time: self.total_time(),
            success_rate: self.success_rate(),
        }
    }

    /// Resets all metrics to zero.
    pub fn reset(&self) {
        for count in &self.inner.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.inner.total_time_ns.store(0, Ordering::Relaxed);
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of runtime metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub started: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub cancelled: u64,
    /// Wall time of finished runs
    pub total_time: Duration,
    /// Succeeded runs over finished runs (0.0 to 1.0)
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_agent::workflow::{FatalError, RunSnapshot, WorkflowDefinition};
    use relay_core::{ErrorKind, RunId};

    fn outcome(status: RunStatus, kind: Option<ErrorKind>) -> RunOutcome {
        let run_id = RunId::new();
        RunOutcome {
            run_id,
            status,
            first_error: kind.map(|kind| FatalError {
                task: None,
                kind,
                message: String::new(),
            }),
            unmet_criteria: Vec::new(),
            rollback: None,
            snapshot: RunSnapshot::for_definition(run_id, &WorkflowDefinition::new("wf")),
        }
    }

    #[test]
    fn test_metrics_record() {
        let metrics = RuntimeMetrics::new();

        metrics.record(MetricKind::RunStarted);
        metrics.record(MetricKind::RunStarted);

        assert_eq!(metrics.count(MetricKind::RunStarted), 2);
        assert_eq!(metrics.count(MetricKind::RunRejected), 0);
    }

    #[test]
    fn test_outcomes_are_classified() {
        let metrics = RuntimeMetrics::new();

        metrics.record_outcome(&outcome(RunStatus::Succeeded, None), Duration::from_millis(100));
        metrics.record_outcome(
            &outcome(RunStatus::RolledBack, Some(ErrorKind::Worker)),
            Duration::from_millis(50),
        );
        metrics.record_outcome(
            &outcome(RunStatus::RolledBack, Some(ErrorKind::Cancelled)),
            Duration::ZERO,
        );

        assert_eq!(metrics.count(MetricKind::RunSucceeded), 1);
        assert_eq!(metrics.count(MetricKind::RunRolledBack), 1);
        assert_eq!(metrics.count(MetricKind::RunCancelled), 1);
        assert_eq!(metrics.finished(), 3);
        assert_eq!(metrics.total_time(), Duration::from_millis(150));
    }

    #[test]
    fn test_success_rate() {
        let metrics = RuntimeMetrics::new();
        assert_eq!(metrics.success_rate(), 0.0);

        metrics.record_outcome(&outcome(RunStatus::Succeeded, None), Duration::ZERO);
        metrics.record_outcome(&outcome(RunStatus::Succeeded, None), Duration::ZERO);
        metrics.record_outcome(&outcome(RunStatus::Failed, Some(ErrorKind::Timeout)), Duration::ZERO);

        // 2 of 3 finished runs succeeded
        assert!((metrics.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = RuntimeMetrics::new();

        metrics.record(MetricKind::RunStarted);
        metrics.record_outcome(&outcome(RunStatus::Succeeded, None), Duration::from_secs(1));

        metrics.reset();

        assert_eq!(metrics.count(MetricKind::RunStarted), 0);
        assert_eq!(metrics.total_time(), Duration::ZERO);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn test_metrics_summary() {
        let metrics = RuntimeMetrics::new();

        metrics.record(MetricKind::RunStarted);
        metrics.record(MetricKind::RunRejected);
        metrics.record_outcome(&outcome(RunStatus::Succeeded, None), Duration::ZERO);

        let summary = metrics.summary();

        assert_eq!(summary.started, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.success_rate, 1.0);
    }
}
