use crate::{
    cursor::CursorCheckpoint,
    ledger::{Ledger, LedgerSnapshot},
    schedule::Schedule,
    unit::PartitionRanges,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Execution mode of a job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Partitioned up front into work units dispatched in parallel.
    Partitioned,
    /// Unbounded stream processed through an opaque cursor.
    Cursor,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Partitioned => "partitioned",
            JobKind::Cursor => "cursor",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted lifecycle state.
///
/// Transitions:
/// - `Idle | Stopped | Completed | Failed` -> `Running` on start/resume
/// - `Running` -> `Completed | Failed` when the poller or cursor loop settles
/// - `Running` -> `Stopped` when a cursor loop honours a stop
/// - `Running` -> `Idle` when a partitioned run is stopped or reset
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition derived by an observer. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCondition {
    Idle,
    Running,
    /// Persisted as running but no local controller is attached.
    RunningOrphaned,
    Stopped,
    Completed,
    Failed,
}

impl JobCondition {
    pub fn derive(status: JobStatus, attached: bool) -> Self {
        match status {
            JobStatus::Idle => JobCondition::Idle,
            JobStatus::Running if attached => JobCondition::Running,
            JobStatus::Running => JobCondition::RunningOrphaned,
            JobStatus::Stopped => JobCondition::Stopped,
            JobStatus::Completed => JobCondition::Completed,
            JobStatus::Failed => JobCondition::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobCondition::Idle => "idle",
            JobCondition::Running => "running",
            JobCondition::RunningOrphaned => "running (orphaned)",
            JobCondition::Stopped => "stopped",
            JobCondition::Completed => "completed",
            JobCondition::Failed => "failed",
        }
    }
}

impl fmt::Display for JobCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable job parameters. Progress lives in [`JobRecord::ledger`] and
/// [`JobRecord::checkpoint`], never here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct JobConfig {
    pub ranges: PartitionRanges,
    pub batch_size: u32,
    /// Forwarded verbatim to executors (date ranges, flags, ...).
    pub params: BTreeMap<String, String>,
}

/// Caller-supplied description used to create a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub id: Option<String>,
    pub name: String,
    pub kind: JobKind,
    pub config: JobConfig,
    pub schedule: Option<Schedule>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub config: JobConfig,
    pub ledger: Ledger,
    pub checkpoint: Option<CursorCheckpoint>,
    pub totals_processed: u64,
    pub last_error: Option<String>,
    pub note: Option<String>,
    pub stop_requested: bool,
    pub owner: Option<String>,
    pub schedule: Option<Schedule>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl JobRecord {
    pub fn new(def: JobDefinition) -> Self {
        let now = Utc::now();
        JobRecord {
            id: def
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: def.name,
            kind: def.kind,
            status: JobStatus::Idle,
            config: def.config,
            ledger: Ledger::default(),
            checkpoint: None,
            totals_processed: 0,
            last_error: None,
            note: None,
            stop_requested: false,
            owner: None,
            schedule: def.schedule,
            started_at: None,
            finished_at: None,
            last_duration_ms: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Prepares the record for a new run or resume attempt.
    pub fn begin_run(&mut self, owner: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.last_error = None;
        self.note = None;
        self.stop_requested = false;
        self.owner = Some(owner.to_string());
        self.started_at = Some(now);
        self.finished_at = None;
        self.last_duration_ms = None;
    }

    /// Records the end of a run and its elapsed time since `started_at`.
    pub fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
        self.last_duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }

    pub fn progress(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule.as_ref().is_some_and(|s| s.is_due(now))
    }
}
