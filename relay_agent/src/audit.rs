//! Audit trail with hash-chained records and JSON Lines persistence.
//!
//! Every task attempt and every phase, run and compensation transition of a
//! workflow run is appended to the run's [`AuditLog`]. Records are ordered
//! by sequence number and never modified. Each record carries a SHA-256
//! digest over its own content and its predecessor's digest, so a persisted
//! log can be checked for truncation or tampering with [`verify_chain`].
//!
//! # Persistence
//!
//! A log created with [`AuditLog::with_dir`] appends each record as one JSON
//! line to `{audit_dir}/{run_id}.jsonl` as soon as it is recorded.
//!
//! # Replay
//!
//! [`RunHistory::from_records`] folds a record sequence back into the run's
//! final state: run status, per-phase status, per-task status and attempt
//! count, compensation outcomes and unmet criteria.

use crate::workflow::criteria::Severity;
use crate::workflow::phase::PhaseStatus;
use crate::workflow::rollback::CompensationStatus;
use crate::workflow::state::RunStatus;
use chrono::{DateTime, Utc};
use relay_core::{ErrorKind, PhaseId, RunId, TaskError, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Error types for audit operations.
#[derive(Error, Debug)]
pub enum AuditError {
    /// Failed to serialize or parse a record
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Failed to read or write the audit file
    #[error("Audit file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A line of a persisted log did not parse
    #[error("Malformed audit record at line {line}: {source}")]
    MalformedRecord {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Digest or sequence mismatch
    #[error("Audit chain broken at record {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Run accepted and started
    RunStarted { workflow: String, task_count: usize },
    /// Phase began dispatching tasks
    PhaseStarted,
    /// Task attempt dispatched (`running`) or finished
    TaskAttempt { status: TaskStatus },
    /// Task recorded as skipped without running
    TaskSkipped,
    /// Phase reached a terminal status
    PhaseFinished { status: PhaseStatus },
    /// Success criterion did not hold
    CriterionUnmet {
        criterion: String,
        severity: Severity,
    },
    /// Run status changed
    RunStatusChanged { status: RunStatus },
    /// Compensation step finished
    Compensation {
        step: String,
        status: CompensationStatus,
    },
}

/// One persisted audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the log, from 0
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<PhaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(flatten)]
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Hex SHA-256 over the previous digest and this record
    pub digest: String,
}

impl AuditRecord {
    fn compute_digest(&self, previous: &str) -> Result<String, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.digest = String::new();
        let body = serde_json::to_vec(&unsigned)?;

        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(&body);
        Ok(hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect())
    }
}

/// Builder for a record's content.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    event: AuditEvent,
    phase_id: Option<PhaseId>,
    task_id: Option<TaskId>,
    attempt: Option<u32>,
    error_kind: Option<ErrorKind>,
    detail: Option<String>,
}

impl AuditEntry {
    /// Starts an entry for `event`.
    pub fn new(event: AuditEvent) -> Self {
        Self {
            event,
            phase_id: None,
            task_id: None,
            attempt: None,
            error_kind: None,
            detail: None,
        }
    }

    pub fn phase(mut self, phase: &PhaseId) -> Self {
        self.phase_id = Some(phase.clone());
        self
    }

    pub fn task(mut self, task: &TaskId) -> Self {
        self.task_id = Some(task.clone());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Sets the error kind and uses the error message as detail.
    pub fn error(mut self, error: &TaskError) -> Self {
        self.error_kind = Some(error.kind());
        self.detail = Some(error.to_string());
        self
    }

    pub fn error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

struct AuditState {
    records: Vec<AuditRecord>,
    last_digest: String,
    dir_ready: bool,
}

/// Append-only audit log of one run.
///
/// Clones share the same records, so concurrently running tasks can record
/// through their own handle while sequence numbers stay gap-free.
#[derive(Clone)]
pub struct AuditLog {
    run_id: RunId,
    path: Option<PathBuf>,
    state: Arc<Mutex<AuditState>>,
}

impl AuditLog {
    /// Creates a log kept only in memory.
    pub fn in_memory(run_id: RunId) -> Self {
        Self {
            run_id,
            path: None,
            state: Arc::new(Mutex::new(AuditState {
                records: Vec::new(),
                last_digest: String::new(),
                dir_ready: false,
            })),
        }
    }

    /// Creates a log persisted to `{audit_dir}/{run_id}.jsonl`.
    ///
    /// The directory is created on the first record.
    pub fn with_dir(run_id: RunId, audit_dir: impl AsRef<Path>) -> Self {
        let mut log = Self::in_memory(run_id);
        log.path = Some(Self::file_path(audit_dir, run_id));
        log
    }

    /// Location of a run's log inside an audit directory.
    pub fn file_path(audit_dir: impl AsRef<Path>, run_id: RunId) -> PathBuf {
        audit_dir.as_ref().join(format!("{run_id}.jsonl"))
    }

    /// Run this log belongs to.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Persistence path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends a record and persists it.
    ///
    /// The record is kept in memory even when persisting fails.
    ///
    /// # Returns
    ///
    /// The sealed record, or `AuditError` if it could not be written.
    pub async fn record(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut state = self.state.lock().await;

        let mut record = AuditRecord {
            seq: state.records.len() as u64,
            timestamp: Utc::now(),
            run_id: self.run_id,
            phase_id: entry.phase_id,
            task_id: entry.task_id,
            attempt: entry.attempt,
            event: entry.event,
            error_kind: entry.error_kind,
            detail: entry.detail,
            digest: String::new(),
        };
        record.digest = record.compute_digest(&state.last_digest)?;
        state.last_digest = record.digest.clone();
        state.records.push(record.clone());

        if let Some(path) = &self.path {
            if !state.dir_ready {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                state.dir_ready = true;
            }
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
        }

        Ok(record)
    }

    /// Returns a copy of every record so far.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.state.lock().await.records.clone()
    }

    /// Number of records so far.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Returns true if nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    /// Replays the records recorded so far.
    pub async fn replay(&self) -> RunHistory {
        RunHistory::from_records(&self.records().await)
    }

    /// Reads a persisted log.
    pub async fn load(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let content = tokio::fs::read_to_string(path).await?;
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).map_err(|source| AuditError::MalformedRecord {
                    line: index + 1,
                    source,
                })
            })
            .collect()
    }
}

/// Checks sequence numbers and the digest chain of a record sequence.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), AuditError> {
    let mut previous = String::new();
    for (index, record) in records.iter().enumerate() {
        if record.seq != index as u64 {
            return Err(AuditError::ChainBroken {
                seq: record.seq,
                reason: format!("expected sequence number {index}"),
            });
        }
        let expected = record.compute_digest(&previous)?;
        if expected != record.digest {
            return Err(AuditError::ChainBroken {
                seq: record.seq,
                reason: "digest mismatch".to_string(),
            });
        }
        previous = expected;
    }
    Ok(())
}

/// Final state of one phase, as replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistory {
    pub phase: PhaseId,
    pub status: PhaseStatus,
}

/// Final state of one task, as replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub task: TaskId,
    pub phase: Option<PhaseId>,
    pub status: TaskStatus,
    /// Attempts dispatched
    pub attempts: u32,
    /// Error kind of the last failed attempt
    pub last_error: Option<ErrorKind>,
}

/// Run state reconstructed from an audit log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    pub run_id: Option<RunId>,
    pub workflow: Option<String>,
    /// Last run status recorded
    pub status: Option<RunStatus>,
    /// Every run status in order
    pub transitions: Vec<RunStatus>,
    pub phases: Vec<PhaseHistory>,
    pub tasks: Vec<TaskHistory>,
    pub compensations: Vec<(String, CompensationStatus)>,
    pub unmet_criteria: Vec<String>,
}

impl RunHistory {
    /// Folds records, in sequence order, into the run's history.
    pub fn from_records(records: &[AuditRecord]) -> Self {
        let mut history = RunHistory::default();
        for record in records {
            history.run_id.get_or_insert(record.run_id);
            match &record.event {
                AuditEvent::RunStarted { workflow, .. } => {
                    history.workflow = Some(workflow.clone());
                }
                AuditEvent::PhaseStarted => {
                    if let Some(phase) = &record.phase_id {
                        history.set_phase(phase, PhaseStatus::Running);
                    }
                }
                AuditEvent::PhaseFinished { status } => {
                    if let Some(phase) = &record.phase_id {
                        history.set_phase(phase, *status);
                    }
                }
                AuditEvent::TaskAttempt { status } => {
                    if let Some(task) = &record.task_id {
                        let entry = history.task_entry(task, record.phase_id.as_ref());
                        entry.status = *status;
                        if *status == TaskStatus::Running {
                            entry.attempts = entry.attempts.max(record.attempt.unwrap_or(1));
                        }
                        if record.error_kind.is_some() {
                            entry.last_error = record.error_kind;
                        }
                    }
                }
                AuditEvent::TaskSkipped => {
                    if let Some(task) = &record.task_id {
                        history.task_entry(task, record.phase_id.as_ref()).status =
                            TaskStatus::Skipped;
                    }
                }
                AuditEvent::CriterionUnmet { criterion, .. } => {
                    history.unmet_criteria.push(criterion.clone());
                }
                AuditEvent::RunStatusChanged { status } => {
                    history.status = Some(*status);
                    history.transitions.push(*status);
                }
                AuditEvent::Compensation { step, status } => {
                    history.compensations.push((step.clone(), *status));
                }
            }
        }
        history
    }

    /// Replayed state of one task.
    pub fn task(&self, task: &TaskId) -> Option<&TaskHistory> {
        self.tasks.iter().find(|t| &t.task == task)
    }

    /// Replayed status of one phase.
    pub fn phase_status(&self, phase: &PhaseId) -> Option<PhaseStatus> {
        self.phases
            .iter()
            .find(|p| &p.phase == phase)
            .map(|p| p.status)
    }

    fn set_phase(&mut self, phase: &PhaseId, status: PhaseStatus) {
        match self.phases.iter_mut().find(|p| &p.phase == phase) {
            Some(entry) => entry.status = status,
            None => self.phases.push(PhaseHistory {
                phase: phase.clone(),
                status,
            }),
        }
    }

    fn task_entry(&mut self, task: &TaskId, phase: Option<&PhaseId>) -> &mut TaskHistory {
        let index = match self.tasks.iter().position(|t| &t.task == task) {
            Some(index) => index,
            None => {
                self.tasks.push(TaskHistory {
                    task: task.clone(),
                    phase: phase.cloned(),
                    status: TaskStatus::Pending,
                    attempts: 0,
                    last_error: None,
                });
                self.tasks.len() - 1
            }
        };
        &mut self.tasks[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sample_log(log: &AuditLog) {
        let phase = PhaseId::new("build");
        let task = TaskId::new("compile");
        log.record(AuditEntry::new(AuditEvent::RunStarted {
            workflow: "ci".into(),
            task_count: 1,
        }))
        .await
        .unwrap();
        log.record(AuditEntry::new(AuditEvent::RunStatusChanged {
            status: RunStatus::Running,
        }))
        .await
        .unwrap();
        log.record(AuditEntry::new(AuditEvent::PhaseStarted).phase(&phase))
            .await
            .unwrap();
        for attempt in 1..=2 {
            log.record(
                AuditEntry::new(AuditEvent::TaskAttempt {
                    status: TaskStatus::Running,
                })
                .phase(&phase)
                .task(&task)
                .attempt(attempt),
            )
            .await
            .unwrap();
        }
        log.record(
            AuditEntry::new(AuditEvent::TaskAttempt {
                status: TaskStatus::Failed,
            })
            .phase(&phase)
            .task(&task)
            .attempt(2)
            .error(&TaskError::Timeout { timeout_ms: 5 }),
        )
        .await
        .unwrap();
        log.record(
            AuditEntry::new(AuditEvent::PhaseFinished {
                status: PhaseStatus::Failed,
            })
            .phase(&phase),
        )
        .await
        .unwrap();
        log.record(AuditEntry::new(AuditEvent::Compensation {
            step: "undo-compile".into(),
            status: CompensationStatus::Completed,
        }))
        .await
        .unwrap();
        log.record(AuditEntry::new(AuditEvent::RunStatusChanged {
            status: RunStatus::RolledBack,
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_records_are_sequenced_and_chained() {
        let log = AuditLog::in_memory(RunId::new());
        sample_log(&log).await;

        let records = log.records().await;
        assert_eq!(records.len(), 9);
        assert!(records.iter().enumerate().all(|(i, r)| r.seq == i as u64));
        assert_ne!(records[0].digest, records[1].digest);
        verify_chain(&records).unwrap();
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let log = AuditLog::in_memory(RunId::new());
        sample_log(&log).await;

        let mut records = log.records().await;
        records[4].attempt = Some(7);
        assert!(matches!(
            verify_chain(&records),
            Err(AuditError::ChainBroken { seq: 4, .. })
        ));

        let mut truncated = log.records().await;
        truncated.remove(2);
        assert!(verify_chain(&truncated).is_err());
    }

    #[tokio::test]
    async fn test_persistence_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let audit_dir = temp_dir.path().join("audit");
        let run_id = RunId::new();

        let log = AuditLog::with_dir(run_id, &audit_dir);
        sample_log(&log).await;

        let path = AuditLog::file_path(&audit_dir, run_id);
        assert_eq!(log.path(), Some(path.as_path()));

        let loaded = AuditLog::load(&path).await.unwrap();
        assert_eq!(loaded, log.records().await);
        verify_chain(&loaded).unwrap();
    }

    #[tokio::test]
    async fn test_replay_reconstructs_history() {
        let log = AuditLog::in_memory(RunId::new());
        sample_log(&log).await;

        let history = log.replay().await;
        assert_eq!(history.workflow.as_deref(), Some("ci"));
        assert_eq!(history.status, Some(RunStatus::RolledBack));
        assert_eq!(
            history.transitions,
            vec![RunStatus::Running, RunStatus::RolledBack]
        );
        assert_eq!(
            history.phase_status(&PhaseId::new("build")),
            Some(PhaseStatus::Failed)
        );

        let task = history.task(&TaskId::new("compile")).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.last_error, Some(ErrorKind::Timeout));
        assert_eq!(
            history.compensations,
            vec![("undo-compile".to_string(), CompensationStatus::Completed)]
        );
    }

    #[test]
    fn test_record_serialization_shape() {
        let record = AuditRecord {
            seq: 0,
            timestamp: Utc::now(),
            run_id: RunId::new(),
            phase_id: None,
            task_id: Some(TaskId::new("t")),
            attempt: Some(1),
            event: AuditEvent::TaskAttempt {
                status: TaskStatus::Succeeded,
            },
            error_kind: None,
            detail: None,
            digest: "abc".into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], "task_attempt");
        assert_eq!(value["status"], "succeeded");
        assert!(value.get("phase_id").is_none());

        let back: AuditRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_load_reports_malformed_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.jsonl");
        tokio::fs::write(&path, "{not json}\n").await.unwrap();

        assert!(matches!(
            AuditLog::load(&path).await,
            Err(AuditError::MalformedRecord { line: 1, .. })
        ));
    }
}
