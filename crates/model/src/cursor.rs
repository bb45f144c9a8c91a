use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque continuation token handed out by a streaming executor.
///
/// The orchestrator never interprets or derives cursors; it only stores the
/// value returned by the previous call and passes it back on the next one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Cursor(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resumable state of a cursor-streaming job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CursorCheckpoint {
    /// `None` means start of stream.
    pub cursor: Option<Cursor>,
    pub batch_size: u32,
    pub items_fixed: u64,
    pub items_processed: u64,
    pub batches: u64,
    pub updated_at: DateTime<Utc>,
}

impl CursorCheckpoint {
    pub fn start(batch_size: u32) -> Self {
        CursorCheckpoint {
            cursor: None,
            batch_size,
            items_fixed: 0,
            items_processed: 0,
            batches: 0,
            updated_at: Utc::now(),
        }
    }

    /// Applies the result of a successful call. `next` is stored verbatim.
    pub fn advance(&mut self, next: Option<Cursor>, items_fixed: u64, items_processed: u64) {
        self.cursor = next;
        self.items_fixed += items_fixed;
        self.items_processed += items_processed;
        self.batches += 1;
        self.updated_at = Utc::now();
    }

    pub fn is_at_start(&self) -> bool {
        self.cursor.is_none()
    }
}
