use crate::{
    cursor_loop::CursorLoop,
    dispatcher::Dispatcher,
    error::OrchestratorError,
    ledger::LedgerHandle,
    poller::{ConvergencePoller, PollOutcome},
};
use chrono::{DateTime, Utc};
use engine_config::settings::OrchestratorSettings;
use engine_core::{
    event_bus::bus::EventBus,
    metrics::{Metrics, MetricsSnapshot},
    retry::RetryPolicy,
    state::{JobStore, job_state::JobState},
};
use engine_processing::{
    executor::{
        CursorExecutor, UnitExecutor,
        http::{DEFAULT_TIMEOUT, HttpCursorExecutor, HttpUnitExecutor},
    },
    partition::{partition, remaining},
    reader::CursorReader,
};
use model::{
    cursor::{Cursor, CursorCheckpoint},
    events::{JobFinished, JobStarted},
    job::{JobCondition, JobDefinition, JobKind, JobRecord, JobStatus},
    ledger::{Ledger, LedgerSnapshot},
    unit::WorkUnit,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a `resume` call decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Failed units were cleared and are being dispatched again.
    RetryingFailed { units: usize },
    /// No failures recorded; the uncompleted rest of the partition is dispatched.
    ResumingRemaining { units: usize },
    /// Cursor job continuing from its persisted checkpoint.
    ResumedCursor { cursor: Option<Cursor> },
    /// Nothing left to do. No dispatch happened.
    AlreadyComplete,
}

/// Observer's view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub record: JobRecord,
    pub condition: JobCondition,
    pub progress: LedgerSnapshot,
}

impl JobView {
    fn new(record: JobRecord, attached: bool) -> Self {
        let progress = match record.kind {
            JobKind::Partitioned => record.progress(),
            JobKind::Cursor => LedgerSnapshot {
                items_processed: record.totals_processed,
                ..Default::default()
            },
        };
        JobView {
            condition: JobCondition::derive(record.status, attached),
            progress,
            record,
        }
    }
}

enum RunPlan {
    Units(Vec<WorkUnit>),
    Cursor,
}

struct ActiveRun {
    cancel: CancellationToken,
    /// Cancelled once the run task has returned.
    done: CancellationToken,
    progress: watch::Receiver<LedgerSnapshot>,
}

/// Control surface over persisted jobs.
///
/// Each started job gets one background run task owned by this instance. A
/// job whose record says `Running` while no run task is attached here is
/// reported as orphaned.
#[derive(Clone)]
pub struct Orchestrator {
    state: JobState,
    settings: OrchestratorSettings,
    unit_executor: Option<Arc<dyn UnitExecutor>>,
    cursor_executor: Option<Arc<dyn CursorExecutor>>,
    ledger: LedgerHandle,
    bus: EventBus,
    metrics: Metrics,
    instance_id: String,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime; the ledger writer is spawned here.
    pub fn new(store: Arc<dyn JobStore>, settings: OrchestratorSettings) -> Self {
        let state = JobState::new(store);
        let (ledger, _writer) = LedgerHandle::spawn(state.clone());
        Self {
            state,
            settings,
            unit_executor: None,
            cursor_executor: None,
            ledger,
            bus: EventBus::new(),
            metrics: Metrics::new(),
            instance_id: format!("orchestrator-{}", uuid::Uuid::new_v4()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builds an orchestrator with HTTP executors for every configured endpoint.
    pub fn from_settings(
        store: Arc<dyn JobStore>,
        settings: OrchestratorSettings,
    ) -> Result<Self, OrchestratorError> {
        let endpoints = settings.executors.clone();
        let timeout = endpoints.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let mut orchestrator = Self::new(store, settings);

        if let Some(url) = endpoints.unit_url {
            let executor = HttpUnitExecutor::new(url, endpoints.auth_token.clone(), timeout)?;
            orchestrator = orchestrator.with_unit_executor(Arc::new(executor));
        }
        if let Some(url) = endpoints.cursor_url {
            let executor = HttpCursorExecutor::new(url, endpoints.auth_token, timeout)?;
            orchestrator = orchestrator.with_cursor_executor(Arc::new(executor));
        }
        Ok(orchestrator)
    }

    pub fn with_unit_executor(mut self, executor: Arc<dyn UnitExecutor>) -> Self {
        self.unit_executor = Some(executor);
        self
    }

    pub fn with_cursor_executor(mut self, executor: Arc<dyn CursorExecutor>) -> Self {
        self.cursor_executor = Some(executor);
        self
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Persists a new idle job. Partitioned jobs get a ledger sized to their partition.
    pub async fn create(&self, def: JobDefinition) -> Result<JobRecord, OrchestratorError> {
        let mut job = JobRecord::new(def);
        match job.kind {
            JobKind::Partitioned => {
                job.ledger = Ledger::new(job.config.ranges.unit_count() as u64);
            }
            JobKind::Cursor if job.config.batch_size == 0 => {
                job.config.batch_size = self.settings.cursor.batch_size;
            }
            JobKind::Cursor => {}
        }

        self.state.insert(&job).await?;
        info!(
            job_id = %job.id,
            kind = %job.kind,
            units = job.ledger.total_units,
            "Job created"
        );
        Ok(job)
    }

    /// Fresh run: progress from any earlier run is discarded.
    pub async fn start(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        let mut active = self.active.lock().await;
        if active.contains_key(job_id) {
            return Err(OrchestratorError::AlreadyRunning(job_id.to_string()));
        }

        let kind = self.state.load(job_id).await?.kind;
        self.ensure_executor(kind)?;

        let owner = self.instance_id.clone();
        let (job, plan) = self
            .state
            .try_modify(job_id, |job| {
                if job.status == JobStatus::Running {
                    return Err(OrchestratorError::Orphaned(job.id.clone()));
                }
                job.begin_run(&owner, Utc::now());
                job.totals_processed = 0;
                Ok(match job.kind {
                    JobKind::Partitioned => {
                        let units = partition(&job.config.ranges);
                        job.ledger = job.ledger.next_run(units.len() as u64);
                        RunPlan::Units(units)
                    }
                    JobKind::Cursor => {
                        job.checkpoint = Some(CursorCheckpoint::start(job.config.batch_size));
                        RunPlan::Cursor
                    }
                })
            })
            .await?;

        info!(job_id, kind = %job.kind, owner = %owner, "Starting job");
        self.launch(&mut active, job.clone(), plan, false).await;
        Ok(job)
    }

    /// Continues a job from its persisted progress.
    ///
    /// Partitioned jobs retry exactly their failed units when there are any,
    /// otherwise dispatch whatever part of the partition is not completed yet.
    /// Cursor jobs pick up at the stored checkpoint. Resuming an orphaned job
    /// is allowed; it is the operator's way to re-attach it.
    pub async fn resume(&self, job_id: &str) -> Result<ResumeOutcome, OrchestratorError> {
        let mut active = self.active.lock().await;
        if active.contains_key(job_id) {
            return Err(OrchestratorError::AlreadyRunning(job_id.to_string()));
        }

        let kind = self.state.load(job_id).await?.kind;
        self.ensure_executor(kind)?;

        let owner = self.instance_id.clone();
        let (job, (outcome, plan)) = self
            .state
            .modify(job_id, |job| {
                let now = Utc::now();
                let decision = match job.kind {
                    JobKind::Partitioned => plan_partitioned_resume(job),
                    JobKind::Cursor => plan_cursor_resume(job),
                };
                match decision {
                    (ResumeOutcome::AlreadyComplete, _) => {
                        job.stop_requested = false;
                        job.last_error = None;
                        if job.status != JobStatus::Completed {
                            job.ledger.in_flight.clear();
                            job.finish(JobStatus::Completed, now);
                        }
                        (ResumeOutcome::AlreadyComplete, None)
                    }
                    (outcome, plan) => {
                        job.begin_run(&owner, now);
                        (outcome, plan)
                    }
                }
            })
            .await?;

        match plan {
            Some(plan) => {
                info!(job_id, outcome = ?outcome, "Resuming job");
                self.launch(&mut active, job, plan, true).await;
            }
            None => info!(job_id, "Nothing left to resume, job is complete"),
        }
        Ok(outcome)
    }

    /// Requests a cooperative stop.
    ///
    /// The persisted flag is honoured by a cursor loop in any process before
    /// its next call. A partitioned job goes back to `Idle` at once; calls
    /// already in flight still report into the ledger.
    pub async fn stop(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        let active = self.active.lock().await;
        let attached = active.contains_key(job_id);

        let (job, settled) = self
            .state
            .modify(job_id, |job| {
                if job.status != JobStatus::Running {
                    return false;
                }
                job.stop_requested = true;
                match job.kind {
                    JobKind::Partitioned => {
                        job.ledger.in_flight.clear();
                        job.finish(JobStatus::Idle, Utc::now());
                        true
                    }
                    JobKind::Cursor if !attached => {
                        job.finish(JobStatus::Stopped, Utc::now());
                        true
                    }
                    JobKind::Cursor => false,
                }
            })
            .await?;

        if let Some(run) = active.get(job_id) {
            run.cancel.cancel();
        }
        drop(active);

        if settled {
            self.bus
                .publish(JobFinished {
                    job_id: job.id.clone(),
                    status: job.status,
                    note: None,
                    error: None,
                    timestamp: Utc::now(),
                })
                .await;
        }
        info!(job_id, status = %job.status, attached, "Stop requested");
        Ok(job)
    }

    /// Discards all progress and returns the job to `Idle`.
    pub async fn reset(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        let active = self.active.lock().await;
        if active.contains_key(job_id) {
            return Err(OrchestratorError::AlreadyRunning(job_id.to_string()));
        }

        let (job, ()) = self
            .state
            .modify(job_id, |job| {
                job.status = JobStatus::Idle;
                job.ledger = match job.kind {
                    JobKind::Partitioned => {
                        job.ledger.next_run(job.config.ranges.unit_count() as u64)
                    }
                    JobKind::Cursor => Ledger::default(),
                };
                job.checkpoint = None;
                job.totals_processed = 0;
                job.last_error = None;
                job.note = None;
                job.stop_requested = false;
                job.owner = None;
                job.started_at = None;
                job.finished_at = None;
            })
            .await?;

        warn!(job_id, "Job reset, previous progress discarded");
        Ok(job)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobView, OrchestratorError> {
        let record = self.state.load(job_id).await?;
        let attached = self.is_attached(job_id).await;
        Ok(JobView::new(record, attached))
    }

    pub async fn list(&self) -> Result<Vec<JobView>, OrchestratorError> {
        let records = self.state.list().await?;
        let active = self.active.lock().await;
        Ok(records
            .into_iter()
            .map(|record| {
                let attached = active.contains_key(&record.id);
                JobView::new(record, attached)
            })
            .collect())
    }

    /// Jobs whose schedule says they should run at `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, OrchestratorError> {
        Ok(self
            .state
            .list()
            .await?
            .into_iter()
            .filter(|job| job.is_due(now))
            .collect())
    }

    pub async fn is_attached(&self, job_id: &str) -> bool {
        self.active.lock().await.contains_key(job_id)
    }

    /// Live progress of a run attached to this instance.
    pub async fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<LedgerSnapshot>> {
        self.active
            .lock()
            .await
            .get(job_id)
            .map(|run| run.progress.clone())
    }

    /// Waits for the local run of `job_id` to return, then reloads the record.
    pub async fn wait(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        let done = self
            .active
            .lock()
            .await
            .get(job_id)
            .map(|run| run.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
        Ok(self.state.load(job_id).await?)
    }

    /// Cancels every attached run without touching the stop flags.
    pub async fn shutdown(&self) {
        let active = self.active.lock().await;
        for (job_id, run) in active.iter() {
            debug!(job_id = %job_id, "Cancelling run");
            run.cancel.cancel();
        }
    }

    fn ensure_executor(&self, kind: JobKind) -> Result<(), OrchestratorError> {
        match kind {
            JobKind::Partitioned if self.unit_executor.is_none() => {
                Err(OrchestratorError::MissingExecutor("unit"))
            }
            JobKind::Cursor if self.cursor_executor.is_none() => {
                Err(OrchestratorError::MissingExecutor("cursor"))
            }
            _ => Ok(()),
        }
    }

    async fn launch(
        &self,
        active: &mut HashMap<String, ActiveRun>,
        job: JobRecord,
        plan: RunPlan,
        resumed: bool,
    ) {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(JobView::new(job.clone(), true).progress);

        let units = match &plan {
            RunPlan::Units(units) => units.len() as u64,
            RunPlan::Cursor => 0,
        };
        self.bus
            .publish(JobStarted {
                job_id: job.id.clone(),
                resumed,
                units,
                timestamp: Utc::now(),
            })
            .await;

        active.insert(
            job.id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                done: done.clone(),
                progress: progress_rx,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            let job_id = job.id.clone();
            this.supervise(job, plan, progress_tx, cancel).await;
            this.active.lock().await.remove(&job_id);
            done.cancel();
        });
    }

    async fn supervise(
        &self,
        job: JobRecord,
        plan: RunPlan,
        progress: watch::Sender<LedgerSnapshot>,
        cancel: CancellationToken,
    ) {
        let job_id = job.id.clone();
        let this = self.clone();
        let run = tokio::spawn(async move { this.drive(job, plan, progress, cancel).await });

        let result = match run.await {
            Ok(result) => result,
            Err(e) => Err(OrchestratorError::from(e)),
        };
        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "Job run aborted");
            self.mark_failed(&job_id, &e).await;
        }
    }

    async fn drive(
        &self,
        job: JobRecord,
        plan: RunPlan,
        progress: watch::Sender<LedgerSnapshot>,
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        match plan {
            RunPlan::Units(units) => self.run_partitioned(job, units, progress, cancel).await,
            RunPlan::Cursor => self.run_cursor(job, progress, cancel).await,
        }
    }

    async fn run_partitioned(
        &self,
        job: JobRecord,
        units: Vec<WorkUnit>,
        progress: watch::Sender<LedgerSnapshot>,
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let executor = self
            .unit_executor
            .clone()
            .ok_or(OrchestratorError::MissingExecutor("unit"))?;

        let dispatcher = Dispatcher::new(
            executor,
            self.ledger.clone(),
            self.settings.dispatch.clone(),
            self.metrics.clone(),
        );
        let poller = ConvergencePoller::new(
            self.state.clone(),
            self.bus.clone(),
            self.settings.poller.clone(),
            self.settings.failure_policy,
            self.metrics.clone(),
        );

        let dispatch_cancel = cancel.child_token();
        let dispatch = {
            let token = dispatch_cancel.clone();
            let job_id = job.id.clone();
            let pass = job.ledger.pass;
            let params = job.config.params.clone();
            tokio::spawn(async move { dispatcher.dispatch(&job_id, pass, units, &params, &token).await })
        };

        let outcome = poller.run(&job.id, &progress, &cancel).await;

        // Whatever ended polling, no new units start from here on.
        dispatch_cancel.cancel();
        let report = dispatch.await?;
        debug!(
            job_id = %job.id,
            dispatched = report.dispatched,
            skipped = report.skipped,
            detached = report.detached,
            "Dispatch pass joined"
        );

        match outcome? {
            PollOutcome::Converged(done) => {
                info!(job_id = %done.id, status = %done.status, "Partitioned run finished");
            }
            PollOutcome::TimedOut(snapshot) => {
                warn!(
                    job_id = %job.id,
                    remaining = snapshot.remaining,
                    "Run detached before convergence, job needs a resume"
                );
            }
            PollOutcome::Interrupted => debug!(job_id = %job.id, "Partitioned run interrupted"),
        }
        Ok(())
    }

    async fn run_cursor(
        &self,
        job: JobRecord,
        progress: watch::Sender<LedgerSnapshot>,
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let executor = self
            .cursor_executor
            .clone()
            .ok_or(OrchestratorError::MissingExecutor("cursor"))?;

        let cursor_settings = &self.settings.cursor;
        let batch_size = match job.config.batch_size {
            0 => cursor_settings.batch_size,
            n => n,
        };
        let reader = CursorReader::new(
            executor,
            RetryPolicy::fixed(cursor_settings.retry_attempts, cursor_settings.retry_delay),
            job.id.clone(),
            batch_size,
            job.config.params.clone(),
        );

        let outcome = CursorLoop::new(
            self.state.clone(),
            self.bus.clone(),
            cursor_settings.clone(),
            self.metrics.clone(),
        )
        .run(&job.id, &reader, &progress, &cancel)
        .await?;

        let record = outcome.record();
        info!(
            job_id = %job.id,
            status = %record.status,
            items_processed = record.totals_processed,
            "Cursor run finished"
        );
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, err: &OrchestratorError) {
        let message = err.to_string();
        let result = self
            .state
            .modify(job_id, |job| {
                if job.status != JobStatus::Running {
                    return false;
                }
                job.last_error = Some(message.clone());
                job.finish(JobStatus::Failed, Utc::now());
                true
            })
            .await;

        match result {
            Ok((job, true)) => {
                self.bus
                    .publish(JobFinished {
                        job_id: job.id.clone(),
                        status: job.status,
                        note: job.note.clone(),
                        error: job.last_error.clone(),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            Ok((_, false)) => {}
            Err(e) => error!(job_id, error = %e, "Could not record run failure"),
        }
    }
}

fn plan_partitioned_resume(job: &mut JobRecord) -> (ResumeOutcome, Option<RunPlan>) {
    if job.ledger.failed_count() > 0 {
        let units = job.ledger.take_failed_for_retry();
        return (
            ResumeOutcome::RetryingFailed { units: units.len() },
            Some(RunPlan::Units(units)),
        );
    }

    let units = remaining(&job.config.ranges, &job.ledger.completed);
    if units.is_empty() {
        return (ResumeOutcome::AlreadyComplete, None);
    }
    job.ledger.reset_for_resume(&units);
    (
        ResumeOutcome::ResumingRemaining { units: units.len() },
        Some(RunPlan::Units(units)),
    )
}

fn plan_cursor_resume(job: &mut JobRecord) -> (ResumeOutcome, Option<RunPlan>) {
    if job.status == JobStatus::Completed && job.checkpoint.is_none() {
        return (ResumeOutcome::AlreadyComplete, None);
    }
    let batch_size = job.config.batch_size;
    let checkpoint = job
        .checkpoint
        .get_or_insert_with(|| CursorCheckpoint::start(batch_size));
    (
        ResumeOutcome::ResumedCursor {
            cursor: checkpoint.cursor.clone(),
        },
        Some(RunPlan::Cursor),
    )
}
