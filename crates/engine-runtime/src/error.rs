use engine_config::settings::error::SettingsError;
use engine_core::error::StoreError;
use engine_processing::error::ExecutorError;
use thiserror::Error;

/// Top-level errors of the job orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{0}' is already running in this process")]
    AlreadyRunning(String),

    /// Persisted as running, but nothing in this process is driving it.
    #[error("Job '{0}' is marked running but has no live controller; resume or reset it")]
    Orphaned(String),

    #[error("No {0} executor is configured")]
    MissingExecutor(&'static str),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    /// An error occurred while joining a task.
    /// This usually indicates that the task was cancelled or panicked.
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(job_id) => OrchestratorError::NotFound(job_id),
            other => OrchestratorError::Store(other),
        }
    }
}

/// Common error type for all actors in the engine.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("Mailbox closed")]
    MailboxClosed,

    #[error("Actor internal error: {0}")]
    Internal(String),
}
