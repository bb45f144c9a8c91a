use model::cursor::Cursor;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Executor call timed out")]
    Timeout,

    #[error("Could not reach executor: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Executor returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Executor rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid executor response: {0}")]
    Decode(String),

    #[error("No executor configured for {0} jobs")]
    NotConfigured(&'static str),
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExecutorError::Timeout
        } else if err.is_connect() {
            ExecutorError::Connect(err.to_string())
        } else if err.is_decode() {
            ExecutorError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ExecutorError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            ExecutorError::Transport(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Fetch failed at cursor {cursor:?}: {source}")]
    Fatal {
        cursor: Option<Cursor>,
        attempts: usize,
        #[source]
        source: ExecutorError,
    },

    #[error("Retry attempts exhausted after {attempts} calls: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: ExecutorError,
    },
}

impl FetchError {
    /// Calls spent on the iteration, the first included.
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Fatal { attempts, .. } | FetchError::RetriesExhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}
