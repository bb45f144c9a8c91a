use crate::error::OrchestratorError;
use chrono::{DateTime, Utc};
use engine_config::settings::{FailurePolicy, PollerSettings};
use engine_core::{event_bus::bus::EventBus, metrics::Metrics, state::job_state::JobState};
use model::{
    events::{ConvergenceTimedOut, JobFinished, ProgressReported},
    job::{JobRecord, JobStatus},
    ledger::LedgerSnapshot,
};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The ledger converged and the job was moved to its terminal status.
    Converged(JobRecord),
    /// The ceiling elapsed first; the job is left running and orphaned.
    TimedOut(LedgerSnapshot),
    /// Cancelled, or the job left `Running` underneath the poller.
    Interrupted,
}

/// Observes a job's ledger until it converges or the ceiling elapses.
#[derive(Clone)]
pub struct ConvergencePoller {
    state: JobState,
    bus: EventBus,
    settings: PollerSettings,
    failure_policy: FailurePolicy,
    metrics: Metrics,
}

impl ConvergencePoller {
    pub fn new(
        state: JobState,
        bus: EventBus,
        settings: PollerSettings,
        failure_policy: FailurePolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            state,
            bus,
            settings,
            failure_policy,
            metrics,
        }
    }

    pub async fn run(
        &self,
        job_id: &str,
        progress: &watch::Sender<LedgerSnapshot>,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, OrchestratorError> {
        let deadline = Instant::now() + self.settings.ceiling;
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(job_id, "Convergence poller cancelled");
                    return Ok(PollOutcome::Interrupted);
                }
                _ = ticker.tick() => {}
            }

            self.metrics.poll();
            let job = self.state.load(job_id).await?;
            let snapshot = job.progress();

            progress.send_replace(snapshot);
            self.bus
                .publish(ProgressReported {
                    job_id: job_id.to_string(),
                    progress: snapshot,
                    timestamp: Utc::now(),
                })
                .await;
            debug!(
                job_id,
                completed = snapshot.completed,
                failed = snapshot.failed,
                remaining = snapshot.remaining,
                items_processed = snapshot.items_processed,
                "Polled job progress"
            );

            if job.status != JobStatus::Running {
                debug!(job_id, status = %job.status, "Job no longer running, poller exiting");
                return Ok(PollOutcome::Interrupted);
            }

            if snapshot.is_converged() {
                return self.settle(job_id).await;
            }

            if Instant::now() >= deadline {
                warn!(
                    job_id,
                    ceiling_secs = self.settings.ceiling.as_secs(),
                    remaining = snapshot.remaining,
                    "Convergence ceiling reached, leaving job running without a poller"
                );
                self.bus
                    .publish(ConvergenceTimedOut {
                        job_id: job_id.to_string(),
                        progress: snapshot,
                        timestamp: Utc::now(),
                    })
                    .await;
                return Ok(PollOutcome::TimedOut(snapshot));
            }
        }
    }

    async fn settle(&self, job_id: &str) -> Result<PollOutcome, OrchestratorError> {
        let policy = self.failure_policy;
        let (job, settled) = self
            .state
            .modify(job_id, |job| {
                if job.status != JobStatus::Running || !job.ledger.is_converged() {
                    return false;
                }
                apply_convergence(job, policy, Utc::now());
                true
            })
            .await?;

        if !settled {
            return Ok(PollOutcome::Interrupted);
        }

        info!(
            job_id,
            status = %job.status,
            completed = job.ledger.completed_count(),
            failed = job.ledger.failed_count(),
            duration_ms = job.last_duration_ms.unwrap_or_default(),
            "Job converged"
        );
        self.bus
            .publish(JobFinished {
                job_id: job_id.to_string(),
                status: job.status,
                note: job.note.clone(),
                error: job.last_error.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(PollOutcome::Converged(job))
    }
}

/// Moves a converged job to its terminal status according to `policy`.
pub fn apply_convergence(job: &mut JobRecord, policy: FailurePolicy, now: DateTime<Utc>) {
    let progress = job.progress();
    job.totals_processed = progress.items_processed;
    job.ledger.in_flight.clear();

    if progress.failed == 0 {
        job.finish(JobStatus::Completed, now);
        return;
    }

    let summary = format!("{} of {} units failed", progress.failed, progress.total);
    match policy {
        FailurePolicy::CompleteWithNote => {
            job.note = Some(summary);
            job.finish(JobStatus::Completed, now);
        }
        FailurePolicy::Fail => {
            job.last_error = Some(summary);
            job.finish(JobStatus::Failed, now);
        }
    }
}
