use crate::{
    actor::{Actor, ActorRef, messages::LedgerMsg, spawn::spawn_actor},
    error::{ActorError, OrchestratorError},
};
use async_trait::async_trait;
use chrono::Utc;
use engine_core::{error::StoreError, state::job_state::JobState};
use model::{ledger::LedgerChange, unit::WorkUnit};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAILBOX_CAPACITY: usize = 256;

/// Single writer for ledger transitions.
///
/// Each message becomes one read-merge-write cycle on the job record. Only the
/// ledger and the derived `totals_processed` are touched, so control fields
/// written concurrently (stop flag, status) are preserved.
pub struct LedgerWriter {
    state: JobState,
}

impl LedgerWriter {
    pub fn new(state: JobState) -> Self {
        Self { state }
    }

    async fn apply_success(
        &self,
        job_id: &str,
        pass: u32,
        unit: &WorkUnit,
        items_processed: u64,
    ) -> Result<LedgerChange, StoreError> {
        let (job, change) = self
            .state
            .modify(job_id, |job| {
                let change = job.ledger.record_success(unit, items_processed, Utc::now());
                job.totals_processed = job.ledger.items_processed();
                change
            })
            .await?;

        if change.is_applied() {
            debug!(
                job_id,
                unit = %unit,
                pass,
                late = pass < job.ledger.pass,
                items_processed,
                completed = job.ledger.completed_count(),
                total = job.ledger.total_units,
                "Unit completed"
            );
        } else {
            debug!(job_id, unit = %unit, "Duplicate success ignored");
        }
        Ok(change)
    }

    async fn apply_failure(
        &self,
        job_id: &str,
        pass: u32,
        unit: &WorkUnit,
        error: &str,
    ) -> Result<LedgerChange, StoreError> {
        let (job, change) = self
            .state
            .modify(job_id, |job| {
                if job.ledger.is_superseded(pass, unit) {
                    return LedgerChange::Ignored;
                }
                job.ledger.record_failure(unit, error, Utc::now())
            })
            .await?;

        if change.is_applied() {
            warn!(
                job_id,
                unit = %unit,
                attempts = job.ledger.attempts_for(unit),
                error,
                "Unit failed"
            );
        } else {
            debug!(
                job_id,
                unit = %unit,
                pass,
                current_pass = job.ledger.pass,
                "Late failure ignored"
            );
        }
        Ok(change)
    }
}

#[async_trait]
impl Actor for LedgerWriter {
    type Msg = LedgerMsg;

    fn name(&self) -> &str {
        "ledger-writer"
    }

    async fn handle(&mut self, msg: LedgerMsg) -> Result<(), ActorError> {
        match msg {
            LedgerMsg::InFlight { job_id, unit } => {
                self.state
                    .modify(&job_id, |job| job.ledger.mark_in_flight(&unit))
                    .await
                    .map_err(|e| ActorError::Internal(e.to_string()))?;
            }

            LedgerMsg::Success {
                job_id,
                pass,
                unit,
                items_processed,
                reply,
            } => {
                let result = self.apply_success(&job_id, pass, &unit, items_processed).await;
                if reply.send(result).is_err() {
                    debug!(job_id = %job_id, "Success recorded for a detached caller");
                }
            }

            LedgerMsg::Failure {
                job_id,
                pass,
                unit,
                error,
                reply,
            } => {
                let result = self.apply_failure(&job_id, pass, &unit, &error).await;
                if reply.send(result).is_err() {
                    debug!(job_id = %job_id, "Failure recorded for a detached caller");
                }
            }
        }
        Ok(())
    }

    async fn on_stop(&mut self, handled: u64) {
        info!(handled, "Ledger writer stopped");
    }
}

/// Cloneable front end of the [`LedgerWriter`] mailbox.
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    actor: ActorRef<LedgerMsg>,
}

impl LedgerHandle {
    pub fn spawn(state: JobState) -> (Self, JoinHandle<()>) {
        let (actor, handle) = spawn_actor(MAILBOX_CAPACITY, LedgerWriter::new(state));
        (Self { actor }, handle)
    }

    pub async fn mark_in_flight(&self, job_id: &str, unit: &WorkUnit) -> Result<(), ActorError> {
        self.actor
            .send(LedgerMsg::InFlight {
                job_id: job_id.to_string(),
                unit: unit.clone(),
            })
            .await
    }

    /// Records a success reported by a call dispatched under ledger
    /// generation `pass`. Completed work is kept whichever pass it came from.
    pub async fn record_success(
        &self,
        job_id: &str,
        pass: u32,
        unit: &WorkUnit,
        items_processed: u64,
    ) -> Result<LedgerChange, OrchestratorError> {
        let result = self
            .actor
            .request(|reply| LedgerMsg::Success {
                job_id: job_id.to_string(),
                pass,
                unit: unit.clone(),
                items_processed,
                reply,
            })
            .await?;
        Ok(result?)
    }

    /// Records a failure from generation `pass`. Ignored when a later pass
    /// has dispatched the unit again.
    pub async fn record_failure(
        &self,
        job_id: &str,
        pass: u32,
        unit: &WorkUnit,
        error: impl Into<String>,
    ) -> Result<LedgerChange, OrchestratorError> {
        let result = self
            .actor
            .request(|reply| LedgerMsg::Failure {
                job_id: job_id.to_string(),
                pass,
                unit: unit.clone(),
                error: error.into(),
                reply,
            })
            .await?;
        Ok(result?)
    }
}
