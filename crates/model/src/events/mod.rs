use crate::{cursor::Cursor, job::JobStatus, ledger::LedgerSnapshot};
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// A trait for events that can be published on the EventBus.
pub trait Event: Send + Sync + Debug + 'static {
    /// Returns a unique identifier for this event type.
    fn event_type(&self) -> &'static str;
}

/// Emitted when a job transitions to running (fresh start or resume).
#[derive(Debug, Clone)]
pub struct JobStarted {
    pub job_id: String,
    pub resumed: bool,
    pub units: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event for JobStarted {
    fn event_type(&self) -> &'static str {
        "job.started"
    }
}

/// Emitted by the convergence poller on every poll.
#[derive(Debug, Clone)]
pub struct ProgressReported {
    pub job_id: String,
    pub progress: LedgerSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl Event for ProgressReported {
    fn event_type(&self) -> &'static str {
        "job.progress"
    }
}

/// Emitted after every successful cursor-loop call.
#[derive(Debug, Clone)]
pub struct CursorAdvanced {
    pub job_id: String,
    pub cursor: Option<Cursor>,
    pub items_processed: u64,
    pub batches: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event for CursorAdvanced {
    fn event_type(&self) -> &'static str {
        "cursor.advanced"
    }
}

/// Emitted when a job settles in a terminal or resumable state.
#[derive(Debug, Clone)]
pub struct JobFinished {
    pub job_id: String,
    pub status: JobStatus,
    pub note: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event for JobFinished {
    fn event_type(&self) -> &'static str {
        match self.status {
            JobStatus::Completed => "job.completed",
            JobStatus::Failed => "job.failed",
            JobStatus::Stopped | JobStatus::Idle => "job.stopped",
            JobStatus::Running => "job.detached",
        }
    }
}

/// Emitted when the poller gives up waiting and leaves the job orphaned.
#[derive(Debug, Clone)]
pub struct ConvergenceTimedOut {
    pub job_id: String,
    pub progress: LedgerSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl Event for ConvergenceTimedOut {
    fn event_type(&self) -> &'static str {
        "job.convergence_timeout"
    }
}
