//! In-memory executors standing in for the remote services.

use async_trait::async_trait;
use engine_processing::{
    error::ExecutorError,
    executor::{
        CursorExecutor, CursorRequest, CursorResponse, UnitExecutor, UnitRequest, UnitResponse,
    },
};
use model::cursor::Cursor;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

pub const ITEMS_PER_UNIT: u64 = 100;

/// Unit executor that fails selected units a fixed number of times before
/// letting them succeed.
#[derive(Default)]
pub struct FlakyUnits {
    failures_left: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    latency: Duration,
    slow: HashMap<String, Duration>,
}

impl FlakyUnits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self, key: &str, times: u32) -> Self {
        self.failures_left
            .lock()
            .unwrap()
            .insert(key.to_string(), times);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Calls for `key` take `latency` instead of the shared latency.
    pub fn slow_unit(mut self, key: &str, latency: Duration) -> Self {
        self.slow.insert(key.to_string(), latency);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl UnitExecutor for FlakyUnits {
    async fn execute(&self, request: UnitRequest) -> Result<UnitResponse, ExecutorError> {
        let key = request.unit.key();
        self.calls.lock().unwrap().push(key.clone());

        let latency = self.slow.get(&key).copied().unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fail = match self.failures_left.lock().unwrap().get_mut(&key) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };

        if fail {
            Ok(UnitResponse::failed(format!("upstream rejected {key}")))
        } else {
            Ok(UnitResponse::succeeded(ITEMS_PER_UNIT))
        }
    }
}

#[derive(Debug, Clone)]
pub enum Fault {
    /// Transient error returned `times` times in a row.
    Transient { times: u32 },
    /// Non-retryable rejection, returned once.
    Fatal,
}

/// Cursor executor over `total` synthetic items. Cursors look like `offset:<n>`.
pub struct PagedStream {
    total: u64,
    faults: Mutex<HashMap<u64, Fault>>,
    stall_from: Option<u64>,
    seen: Mutex<Vec<Option<Cursor>>>,
}

impl PagedStream {
    pub fn new(total: u64) -> Self {
        PagedStream {
            total,
            faults: Mutex::new(HashMap::new()),
            stall_from: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn fault_at(self, offset: u64, fault: Fault) -> Self {
        self.faults.lock().unwrap().insert(offset, fault);
        self
    }

    /// From `offset` on, every page is empty and the cursor does not move.
    pub fn stalling_from(mut self, offset: u64) -> Self {
        self.stall_from = Some(offset);
        self
    }

    pub fn seen(&self) -> Vec<Option<Cursor>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn offset_of(cursor: Option<&Cursor>) -> Result<u64, ExecutorError> {
        match cursor {
            None => Ok(0),
            Some(c) => c
                .as_str()
                .strip_prefix("offset:")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| ExecutorError::Rejected(format!("malformed cursor '{c}'"))),
        }
    }

    fn take_fault(&self, offset: u64) -> Option<ExecutorError> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get(&offset).cloned()? {
            Fault::Transient { times } if times > 0 => {
                faults.insert(offset, Fault::Transient { times: times - 1 });
                Some(ExecutorError::Timeout)
            }
            Fault::Transient { .. } => None,
            Fault::Fatal => {
                faults.remove(&offset);
                Some(ExecutorError::Rejected(format!("poison record at {offset}")))
            }
        }
    }
}

pub fn offset(n: u64) -> Cursor {
    Cursor::new(format!("offset:{n}"))
}

#[async_trait]
impl CursorExecutor for PagedStream {
    async fn fetch(&self, request: CursorRequest) -> Result<CursorResponse, ExecutorError> {
        self.seen.lock().unwrap().push(request.cursor.clone());
        let start = Self::offset_of(request.cursor.as_ref())?;

        if let Some(err) = self.take_fault(start) {
            return Err(err);
        }

        if self.stall_from.is_some_and(|from| start >= from) {
            return Ok(CursorResponse {
                next_cursor: Some(offset(start)),
                remaining: Some(self.total.saturating_sub(start)),
                ..Default::default()
            });
        }

        let end = (start + request.batch_size as u64).min(self.total);
        let processed = end - start;
        Ok(CursorResponse {
            next_cursor: Some(offset(end)),
            items_fixed: processed / 2,
            items_processed: processed,
            remaining: Some(self.total - end),
            ..Default::default()
        })
    }
}
