use crate::ledger::LedgerHandle;
use async_trait::async_trait;
use engine_core::{
    event_bus::bus::EventBus,
    state::{JobStore, job_state::JobState, sled_store::SledJobStore},
};
use engine_processing::{
    error::ExecutorError,
    executor::{
        CursorExecutor, CursorRequest, CursorResponse, UnitExecutor, UnitRequest, UnitResponse,
    },
};
use model::{
    cursor::Cursor,
    job::{JobConfig, JobDefinition, JobKind, JobRecord},
    ledger::Ledger,
    unit::{Dimension, PartitionRanges},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;

pub fn letters(values: &[&str]) -> PartitionRanges {
    PartitionRanges::default().with(Dimension::new("letter", values.iter().copied()))
}

pub struct TestEnv {
    pub store: Arc<dyn JobStore>,
    pub state: JobState,
    pub ledger: LedgerHandle,
    pub bus: EventBus,
}

impl TestEnv {
    pub fn empty() -> Self {
        let store: Arc<dyn JobStore> = Arc::new(SledJobStore::temporary().unwrap());
        let state = JobState::new(store.clone());
        let (ledger, _task) = LedgerHandle::spawn(state.clone());
        TestEnv {
            store,
            state,
            ledger,
            bus: EventBus::new(),
        }
    }

    /// Inserts an idle partitioned job whose ledger spans the whole partition.
    pub async fn partitioned(job_id: &str, ranges: PartitionRanges) -> Self {
        let env = Self::empty();
        let mut job = JobRecord::new(definition(job_id, JobKind::Partitioned, ranges, 0));
        job.ledger = Ledger::new(job.config.ranges.unit_count() as u64);
        env.state.insert(&job).await.unwrap();
        env
    }

    pub async fn cursor(job_id: &str, batch_size: u32) -> Self {
        let env = Self::empty();
        let job = JobRecord::new(definition(
            job_id,
            JobKind::Cursor,
            PartitionRanges::default(),
            batch_size,
        ));
        env.state.insert(&job).await.unwrap();
        env
    }
}

pub fn definition(
    job_id: &str,
    kind: JobKind,
    ranges: PartitionRanges,
    batch_size: u32,
) -> JobDefinition {
    JobDefinition {
        id: Some(job_id.to_string()),
        name: format!("{job_id} test job"),
        kind,
        config: JobConfig {
            ranges,
            batch_size,
            ..Default::default()
        },
        schedule: None,
    }
}

#[derive(Debug, Clone)]
enum UnitOutcome {
    Fail(String),
    Error,
}

#[derive(Debug, Clone)]
struct Scripted {
    outcome: UnitOutcome,
    delay: Duration,
}

/// Unit executor that succeeds with 10 items unless a unit has scripted
/// outcomes queued. Each call consumes one scripted outcome for its unit.
#[derive(Default)]
pub struct ScriptedUnits {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<HashMap<String, usize>>,
    latency: Mutex<Duration>,
    slow: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedUnits {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next call for `key` reports `success: false`.
    pub fn fail(self: Arc<Self>, key: &str, error: &str) -> Arc<Self> {
        self.fail_after(key, error, Duration::ZERO)
    }

    /// Next call for `key` reports `success: false` once `delay` has passed.
    pub fn fail_after(self: Arc<Self>, key: &str, error: &str, delay: Duration) -> Arc<Self> {
        self.push(key, UnitOutcome::Fail(error.to_string()), delay);
        self
    }

    /// Next call for `key` fails at the transport level.
    pub fn error(self: Arc<Self>, key: &str) -> Arc<Self> {
        self.push(key, UnitOutcome::Error, Duration::ZERO);
        self
    }

    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        *self.latency.lock().unwrap() = latency;
        self
    }

    /// Every unscripted call for `key` takes `latency`.
    pub fn slow(self: Arc<Self>, key: &str, latency: Duration) -> Arc<Self> {
        self.slow.lock().unwrap().insert(key.to_string(), latency);
        self
    }

    fn push(&self, key: &str, outcome: UnitOutcome, delay: Duration) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(Scripted { outcome, delay });
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn called_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.calls.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitExecutor for ScriptedUnits {
    async fn execute(&self, request: UnitRequest) -> Result<UnitResponse, ExecutorError> {
        let key = request.unit.key();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);

        let latency = match &scripted {
            Some(s) => s.delay,
            None => self.slow.lock().unwrap().get(&key).copied().unwrap_or_default(),
        }
        .max(*self.latency.lock().unwrap());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match scripted.map(|s| s.outcome) {
            None => Ok(UnitResponse::succeeded(10)),
            Some(UnitOutcome::Fail(error)) => Ok(UnitResponse::failed(error)),
            Some(UnitOutcome::Error) => Err(ExecutorError::Timeout),
        }
    }
}

/// Cursor executor replaying a fixed script. Once the script runs out every
/// call reports the stream as done.
pub struct ScriptedCursor {
    replies: Mutex<VecDeque<Result<CursorResponse, ExecutorError>>>,
    seen: Mutex<Vec<Option<Cursor>>>,
    pub called: Notify,
}

impl ScriptedCursor {
    pub fn new(replies: Vec<Result<CursorResponse, ExecutorError>>) -> Arc<Self> {
        Arc::new(ScriptedCursor {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
            called: Notify::new(),
        })
    }

    pub fn seen(&self) -> Vec<Option<Cursor>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl CursorExecutor for ScriptedCursor {
    async fn fetch(&self, request: CursorRequest) -> Result<CursorResponse, ExecutorError> {
        self.seen.lock().unwrap().push(request.cursor);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(CursorResponse {
                    done: true,
                    ..Default::default()
                })
            });
        self.called.notify_one();
        reply
    }
}

/// A successful batch handing out `next`.
pub fn batch(next: &str, items: u64) -> Result<CursorResponse, ExecutorError> {
    Ok(CursorResponse {
        next_cursor: Some(Cursor::new(next)),
        items_processed: items,
        ..Default::default()
    })
}
