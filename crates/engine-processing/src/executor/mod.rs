use crate::error::ExecutorError;
use async_trait::async_trait;
use model::{cursor::Cursor, unit::WorkUnit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod http;

/// One invocation of the per-unit executor.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRequest {
    /// Lets the executor report against the right ledger.
    pub job_id: String,
    pub unit: WorkUnit,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitResponse {
    #[serde(default)]
    pub items_processed: u64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl UnitResponse {
    pub fn succeeded(items_processed: u64) -> Self {
        UnitResponse {
            items_processed,
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        UnitResponse {
            items_processed: 0,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// One call of a streaming executor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRequest {
    pub job_id: String,
    /// `None` asks for the start of the stream.
    pub cursor: Option<Cursor>,
    pub batch_size: u32,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CursorResponse {
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
    #[serde(default)]
    pub items_fixed: u64,
    #[serde(default)]
    pub items_processed: u64,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub remaining: Option<u64>,
    /// Executor-side stop, e.g. a provider quota was hit.
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl CursorResponse {
    /// Stream exhausted: explicit `done` or nothing left to process.
    pub fn is_exhausted(&self) -> bool {
        self.done || self.remaining == Some(0)
    }

    pub fn is_empty(&self) -> bool {
        self.items_processed == 0
    }
}

/// Remote worker processing one work unit. Must tolerate being invoked more
/// than once for the same unit.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(&self, request: UnitRequest) -> Result<UnitResponse, ExecutorError>;
}

/// Remote worker consuming a stream one batch at a time.
#[async_trait]
pub trait CursorExecutor: Send + Sync {
    async fn fetch(&self, request: CursorRequest) -> Result<CursorResponse, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_response_parses_minimal_payload() {
        let resp: CursorResponse =
            serde_json::from_str(r#"{"nextCursor":"tok-2","itemsProcessed":40}"#).unwrap();
        assert_eq!(resp.next_cursor, Some(Cursor::new("tok-2")));
        assert_eq!(resp.items_processed, 40);
        assert!(!resp.done);
        assert!(!resp.stopped);
        assert!(!resp.is_exhausted());
    }

    #[test]
    fn zero_remaining_counts_as_exhausted() {
        let resp: CursorResponse =
            serde_json::from_str(r#"{"nextCursor":null,"itemsProcessed":3,"remaining":0}"#)
                .unwrap();
        assert!(resp.is_exhausted());
    }

    #[test]
    fn unit_response_failure_carries_error() {
        let resp: UnitResponse =
            serde_json::from_str(r#"{"success":false,"error":"quota exceeded"}"#).unwrap();
        assert_eq!(resp, UnitResponse::failed("quota exceeded"));
    }
}
