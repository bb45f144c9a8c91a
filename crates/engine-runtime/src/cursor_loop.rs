use crate::error::OrchestratorError;
use chrono::Utc;
use engine_config::settings::CursorLoopSettings;
use engine_core::{event_bus::bus::EventBus, metrics::Metrics, state::job_state::JobState};
use engine_processing::reader::CursorReader;
use model::{
    cursor::CursorCheckpoint,
    events::{CursorAdvanced, JobFinished},
    job::{JobRecord, JobStatus},
    ledger::LedgerSnapshot,
};
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a cursor run paused in a resumable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stop flag on the record, or local cancellation.
    Requested,
    /// The executor itself asked to stop.
    Executor(Option<String>),
    /// Consecutive batches processed nothing without reporting completion.
    Stalled { empty_batches: u32 },
    /// Per-run batch ceiling reached.
    CeilingReached { batches: u64 },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::Executor(Some(message)) => write!(f, "stopped by executor: {message}"),
            StopReason::Executor(None) => f.write_str("stopped by executor"),
            StopReason::Stalled { empty_batches } => {
                write!(f, "stalled after {empty_batches} consecutive empty batches")
            }
            StopReason::CeilingReached { batches } => {
                write!(f, "paused after {batches} batches, re-run to continue")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CursorOutcome {
    Completed(JobRecord),
    Stopped(JobRecord, StopReason),
    Failed(JobRecord),
}

impl CursorOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            CursorOutcome::Completed(job)
            | CursorOutcome::Stopped(job, _)
            | CursorOutcome::Failed(job) => job,
        }
    }
}

/// Drives a streaming job one executor call at a time.
///
/// The checkpoint persisted after a call is exactly the cursor that call
/// returned; the next call is only issued once that write succeeded. A failed
/// call leaves the last good checkpoint in place.
#[derive(Clone)]
pub struct CursorLoop {
    state: JobState,
    bus: EventBus,
    settings: CursorLoopSettings,
    metrics: Metrics,
}

impl CursorLoop {
    pub fn new(
        state: JobState,
        bus: EventBus,
        settings: CursorLoopSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            state,
            bus,
            settings,
            metrics,
        }
    }

    pub async fn run(
        &self,
        job_id: &str,
        reader: &CursorReader,
        progress: &watch::Sender<LedgerSnapshot>,
        cancel: &CancellationToken,
    ) -> Result<CursorOutcome, OrchestratorError> {
        let job = self.state.load(job_id).await?;
        let mut checkpoint = job
            .checkpoint
            .unwrap_or_else(|| CursorCheckpoint::start(reader.batch_size()));
        let mut empty_streak = 0u32;
        let mut batches = 0u64;

        info!(
            job_id,
            cursor = ?checkpoint.cursor,
            batch_size = reader.batch_size(),
            "Cursor loop started"
        );

        loop {
            if cancel.is_cancelled() || self.state.load(job_id).await?.stop_requested {
                return self.pause(job_id, &checkpoint, StopReason::Requested).await;
            }

            if batches >= self.settings.max_batches {
                return self
                    .pause(job_id, &checkpoint, StopReason::CeilingReached { batches })
                    .await;
            }

            let response = match reader.fetch(checkpoint.cursor.as_ref()).await {
                Ok(fetched) => {
                    self.metrics.cursor_retries(fetched.retries() as u64);
                    fetched.value
                }
                Err(e) => {
                    error!(job_id, cursor = ?checkpoint.cursor, error = %e, "Cursor call failed");
                    self.metrics
                        .cursor_retries(e.attempts().saturating_sub(1) as u64);
                    return self.fail(job_id, e.to_string()).await;
                }
            };

            checkpoint.advance(
                response.next_cursor.clone(),
                response.items_fixed,
                response.items_processed,
            );
            batches += 1;
            self.metrics.cursor_batch(response.items_processed);

            let job = self.persist(job_id, &checkpoint).await?;
            progress.send_replace(LedgerSnapshot {
                items_processed: checkpoint.items_processed,
                ..Default::default()
            });
            self.bus
                .publish(CursorAdvanced {
                    job_id: job_id.to_string(),
                    cursor: checkpoint.cursor.clone(),
                    items_processed: checkpoint.items_processed,
                    batches: checkpoint.batches,
                    timestamp: Utc::now(),
                })
                .await;
            debug!(
                job_id,
                cursor = ?checkpoint.cursor,
                items_processed = response.items_processed,
                items_fixed = response.items_fixed,
                remaining = ?response.remaining,
                "Cursor advanced"
            );

            if job.stop_requested || cancel.is_cancelled() {
                return self.pause(job_id, &checkpoint, StopReason::Requested).await;
            }

            if response.is_exhausted() {
                return self.complete(job_id, &checkpoint).await;
            }

            if response.stopped {
                return self
                    .pause(job_id, &checkpoint, StopReason::Executor(response.message))
                    .await;
            }

            if response.is_empty() {
                empty_streak += 1;
                if empty_streak >= self.settings.max_empty_batches {
                    return self
                        .pause(
                            job_id,
                            &checkpoint,
                            StopReason::Stalled {
                                empty_batches: empty_streak,
                            },
                        )
                        .await;
                }
            } else {
                empty_streak = 0;
            }

            if !self.settings.pacing.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.pacing) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    async fn persist(
        &self,
        job_id: &str,
        checkpoint: &CursorCheckpoint,
    ) -> Result<JobRecord, OrchestratorError> {
        let (job, ()) = self
            .state
            .modify(job_id, |job| {
                job.totals_processed = checkpoint.items_processed;
                job.checkpoint = Some(checkpoint.clone());
            })
            .await?;
        Ok(job)
    }

    async fn complete(
        &self,
        job_id: &str,
        checkpoint: &CursorCheckpoint,
    ) -> Result<CursorOutcome, OrchestratorError> {
        let (job, ()) = self
            .state
            .modify(job_id, |job| {
                job.totals_processed = checkpoint.items_processed;
                job.checkpoint = None;
                job.finish(JobStatus::Completed, Utc::now());
            })
            .await?;

        info!(
            job_id,
            items_processed = checkpoint.items_processed,
            items_fixed = checkpoint.items_fixed,
            batches = checkpoint.batches,
            "Cursor stream exhausted, job completed"
        );
        self.publish_finished(&job).await;
        Ok(CursorOutcome::Completed(job))
    }

    async fn pause(
        &self,
        job_id: &str,
        checkpoint: &CursorCheckpoint,
        reason: StopReason,
    ) -> Result<CursorOutcome, OrchestratorError> {
        let note = match reason {
            StopReason::Requested => None,
            _ => Some(reason.to_string()),
        };
        let (job, ()) = self
            .state
            .modify(job_id, |job| {
                job.totals_processed = checkpoint.items_processed;
                job.checkpoint = Some(checkpoint.clone());
                job.note = note.clone();
                job.finish(JobStatus::Stopped, Utc::now());
            })
            .await?;

        match &reason {
            StopReason::Stalled { .. } | StopReason::CeilingReached { .. } => {
                warn!(job_id, cursor = ?checkpoint.cursor, reason = %reason, "Cursor loop paused")
            }
            _ => info!(job_id, cursor = ?checkpoint.cursor, reason = %reason, "Cursor loop paused"),
        }
        self.publish_finished(&job).await;
        Ok(CursorOutcome::Stopped(job, reason))
    }

    /// Marks the job failed. The checkpoint is left as last persisted.
    async fn fail(&self, job_id: &str, error: String) -> Result<CursorOutcome, OrchestratorError> {
        let (job, ()) = self
            .state
            .modify(job_id, |job| {
                job.last_error = Some(error.clone());
                job.finish(JobStatus::Failed, Utc::now());
            })
            .await?;

        self.publish_finished(&job).await;
        Ok(CursorOutcome::Failed(job))
    }

    async fn publish_finished(&self, job: &JobRecord) {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{ScriptedCursor, TestEnv, batch};
    use engine_core::retry::RetryPolicy;
    use engine_processing::{
        error::ExecutorError,
        executor::{CursorExecutor, CursorResponse},
    };
    use model::cursor::Cursor;
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    fn settings() -> CursorLoopSettings {
        CursorLoopSettings {
            batch_size: 10,
            pacing: Duration::ZERO,
            retry_attempts: 3,
            retry_delay: Duration::ZERO,
            max_empty_batches: 3,
            max_batches: 10_000,
        }
    }

    fn reader(executor: Arc<dyn CursorExecutor>) -> CursorReader {
        CursorReader::new(
            executor,
            RetryPolicy::fixed(3, Duration::ZERO),
            "job",
            10,
            BTreeMap::new(),
        )
    }

    async fn started(env: &TestEnv) {
        env.state
            .modify("job", |job| {
                job.begin_run("test", Utc::now());
                job.checkpoint = Some(CursorCheckpoint::start(10));
            })
            .await
            .unwrap();
    }

    async fn run_loop(
        env: &TestEnv,
        settings: CursorLoopSettings,
        executor: Arc<ScriptedCursor>,
    ) -> CursorOutcome {
        run_loop_with(env, settings, executor, Metrics::new()).await
    }

    async fn run_loop_with(
        env: &TestEnv,
        settings: CursorLoopSettings,
        executor: Arc<ScriptedCursor>,
        metrics: Metrics,
    ) -> CursorOutcome {
        let (tx, _rx) = watch::channel(LedgerSnapshot::default());
        CursorLoop::new(env.state.clone(), env.bus.clone(), settings, metrics)
            .run("job", &reader(executor), &tx, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn done_clears_checkpoint_and_completes() {
        let env = TestEnv::cursor("job", 10).await;
        started(&env).await;
        let executor = ScriptedCursor::new(vec![
            batch("c1", 10),
            batch("c2", 10),
            Ok(CursorResponse {
                next_cursor: None,
                items_processed: 4,
                items_fixed: 1,
                done: true,
                ..Default::default()
            }),
        ]);

        let outcome = run_loop(&env, settings(), executor.clone()).await;

        let CursorOutcome::Completed(job) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.checkpoint.is_none());
        assert_eq!(job.totals_processed, 24);
        assert_eq!(
            executor.seen(),
            vec![None, Some(Cursor::new("c1")), Some(Cursor::new("c2"))]
        );
    }

    #[tokio::test]
    async fn failure_keeps_last_successful_cursor() {
        let env = TestEnv::cursor("job", 10).await;
        started(&env).await;
        let executor = ScriptedCursor::new(vec![
            batch("X", 10),
            Err(ExecutorError::Timeout),
            Err(ExecutorError::Timeout),
            Err(ExecutorError::Timeout),
        ]);

        let outcome = run_loop(&env, settings(), executor.clone()).await;

        let CursorOutcome::Failed(job) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
        let checkpoint = job.checkpoint.unwrap();
        assert_eq!(checkpoint.cursor, Some(Cursor::new("X")));
        assert_eq!(checkpoint.items_processed, 10);
        assert_eq!(executor.calls(), 4);
    }

    #[tokio::test]
    async fn transient_error_recovers_within_iteration() {
        let env = TestEnv::cursor("job", 10).await;
        started(&env).await;
        let executor = ScriptedCursor::new(vec![
            batch("c1", 5),
            Err(ExecutorError::Status {
                status: 503,
                body: String::new(),
            }),
            batch("c2", 5),
        ]);

        let metrics = Metrics::new();
        let outcome = run_loop_with(&env, settings(), executor.clone(), metrics.clone()).await;

        assert!(matches!(outcome, CursorOutcome::Completed(_)));
        assert_eq!(
            executor.seen()[1..3],
            [Some(Cursor::new("c1")), Some(Cursor::new("c1"))]
        );
        let snap = metrics.snapshot();
        assert_eq!(snap.retry_count, 1);
        // c1, c2 and the final empty `done` page
        assert_eq!(snap.cursor_batches, 3);
    }

    #[tokio::test]
    async fn three_empty_batches_stall_the_loop() {
        let env = TestEnv::cursor("job", 10).await;
        started(&env).await;
        let executor = ScriptedCursor::new(vec![
            batch("c1", 10),
            batch("c2", 0),
            batch("c3", 0),
            batch("c4", 0),
            batch("c5", 10),
        ]);

        let outcome = run_loop(&env, settings(), executor.clone()).await;

        let CursorOutcome::Stopped(job, reason) = outcome else {
            panic!("expected stall, got {outcome:?}");
        };
        assert_eq!(reason, StopReason::Stalled { empty_batches: 3 });
        assert_eq!(job.status, JobStatus::Stopped);
        assert_eq!(
            job.note.as_deref(),
            Some("stalled after 3 consecutive empty batches")
        );
        assert_eq!(job.checkpoint.unwrap().cursor, Some(Cursor::new("c4")));
        assert_eq!(executor.calls(), 4);
    }

    #[tokio::test]
    async fn batch_ceiling_pauses_for_rerun() {
        let env = TestEnv::cursor("job", 10).await;
        started(&env).await;
        let executor = ScriptedCursor::new(vec![batch("c1", 1), batch("c2", 1), batch("c3", 1)]);

        let outcome = run_loop(
            &env,
            CursorLoopSettings {
                max_batches: 2,
                ..settings()
            },
            executor.clone(),
        )
        .await;

        let CursorOutcome::Stopped(job, reason) = outcome else {
            panic!("expected pause, got {outcome:?}");
        };
        assert_eq!(reason, StopReason::CeilingReached { batches: 2 });
        assert_eq!(
            job.note.as_deref(),
            Some("paused after 2 batches, re-run to continue")
        );
        assert_eq!(job.checkpoint.unwrap().cursor, Some(Cursor::new("c2")));
    }

    #[tokio::test]
    async fn executor_stop_is_resumable() {
        let env = TestEnv::cursor("job", 10).await;
        started(&env).await;
        let executor = ScriptedCursor::new(vec![Ok(CursorResponse {
            next_cursor: Some(Cursor::new("c1")),
            items_processed: 3,
            stopped: true,
            message: Some("quota reached".into()),
            ..Default::default()
        })]);

        let outcome = run_loop(&env, settings(), executor).await;

        let CursorOutcome::Stopped(job, reason) = outcome else {
            panic!("expected stop, got {outcome:?}");
        };
        assert_eq!(reason, StopReason::Executor(Some("quota reached".into())));
        assert_eq!(job.checkpoint.unwrap().cursor, Some(Cursor::new("c1")));
    }

    #[tokio::test]
    async fn stop_flag_prevents_the_next_call() {
        let env = TestEnv::cursor("job", 10).await;
        started(&env).await;
        let executor = ScriptedCursor::new(vec![batch("c1", 10), batch("c2", 10)]);

        let state = env.state.clone();
        let bus = env.bus.clone();
        let exec = executor.clone();
        let handle = tokio::spawn(async move {
            let (tx, _rx) = watch::channel(LedgerSnapshot::default());
            CursorLoop::new(
                state,
                bus,
                CursorLoopSettings {
                    pacing: Duration::from_millis(200),
                    ..settings()
                },
                Metrics::new(),
            )
            .run("job", &reader(exec), &tx, &CancellationToken::new())
            .await
        });

        executor.called.notified().await;
        env.state
            .modify("job", |job| job.stop_requested = true)
            .await
            .unwrap();

        let outcome = handle.await.unwrap().unwrap();
        let CursorOutcome::Stopped(job, reason) = outcome else {
            panic!("expected stop, got {outcome:?}");
        };
        assert_eq!(reason, StopReason::Requested);
        assert!(job.note.is_none());
        assert_eq!(job.checkpoint.unwrap().cursor, Some(Cursor::new("c1")));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn resumes_from_persisted_checkpoint() {
        let env = TestEnv::cursor("job", 10).await;
        env.state
            .modify("job", |job| {
                job.begin_run("test", Utc::now());
                let mut checkpoint = CursorCheckpoint::start(10);
                checkpoint.advance(Some(Cursor::new("resume-here")), 0, 70);
                job.checkpoint = Some(checkpoint);
            })
            .await
            .unwrap();
        let executor = ScriptedCursor::new(vec![]);

        let outcome = run_loop(&env, settings(), executor.clone()).await;

        assert!(matches!(outcome, CursorOutcome::Completed(_)));
        assert_eq!(executor.seen(), vec![Some(Cursor::new("resume-here"))]);
        assert_eq!(outcome.record().totals_processed, 70);
    }
}
