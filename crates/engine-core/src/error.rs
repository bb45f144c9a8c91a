use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Failed to encode or decode job record: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{0}' already exists")]
    AlreadyExists(String),

    #[error("Job '{job_id}' kept changing underneath {attempts} update attempts")]
    Conflict { job_id: String, attempts: usize },
}
