use crate::ledger::LedgerHandle;
use engine_config::settings::DispatchPolicy;
use engine_core::metrics::Metrics;
use engine_processing::executor::{UnitExecutor, UnitRequest};
use model::unit::WorkUnit;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Summary of one dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Executor calls started.
    pub dispatched: usize,
    /// Units never started because the pass was cancelled.
    pub skipped: usize,
    /// Calls still out when the pass was cancelled; their results still land.
    pub detached: usize,
}

/// Fans pending work units out to the unit executor.
///
/// Units are started in fixed-size windows with a stagger between starts
/// inside a window and a pause between windows; a semaphore caps the number of
/// calls in flight. Each call's outcome goes to the ledger writer. A failed
/// unit is recorded and not retried within the same pass.
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn UnitExecutor>,
    ledger: LedgerHandle,
    policy: DispatchPolicy,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn UnitExecutor>,
        ledger: LedgerHandle,
        policy: DispatchPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            executor,
            ledger,
            policy,
            metrics,
        }
    }

    /// Runs one pass over `units`. Outcomes are recorded under ledger
    /// generation `pass`.
    pub async fn dispatch(
        &self,
        job_id: &str,
        pass: u32,
        units: Vec<WorkUnit>,
        params: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let total = units.len();
        let window = self.policy.batch_size.max(1);
        let permits = Arc::new(Semaphore::new(self.policy.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        let mut report = DispatchReport::default();

        info!(
            job_id,
            pass,
            units = total,
            window,
            max_concurrent = self.policy.max_concurrent,
            "Dispatching work units"
        );

        'windows: for (window_idx, batch) in units.chunks(window).enumerate() {
            if window_idx > 0 && !pause(self.policy.batch_delay, cancel).await {
                break 'windows;
            }

            for (idx, unit) in batch.iter().enumerate() {
                if idx > 0 && !pause(self.policy.stagger, cancel).await {
                    break 'windows;
                }
                if cancel.is_cancelled() {
                    break 'windows;
                }

                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'windows,
                    },
                    _ = cancel.cancelled() => break 'windows,
                };

                if let Err(e) = self.ledger.mark_in_flight(job_id, unit).await {
                    warn!(job_id, unit = %unit, error = %e, "Could not mark unit in flight");
                }

                self.metrics.unit_dispatched();
                report.dispatched += 1;
                debug!(job_id, unit = %unit, "Unit dispatched");

                let call = UnitCall {
                    pass,
                    executor: self.executor.clone(),
                    ledger: self.ledger.clone(),
                    metrics: self.metrics.clone(),
                    request: UnitRequest {
                        job_id: job_id.to_string(),
                        unit: unit.clone(),
                        params: params.clone(),
                    },
                };
                tasks.spawn(async move {
                    call.run().await;
                    drop(permit);
                });
            }
        }

        report.skipped = total - report.dispatched;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => error!(job_id, error = %e, "Unit task failed to complete"),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    report.detached = tasks.len();
                    tasks.detach_all();
                    break;
                }
            }
        }

        if report.skipped > 0 || report.detached > 0 {
            info!(
                job_id,
                dispatched = report.dispatched,
                skipped = report.skipped,
                detached = report.detached,
                "Dispatch pass cancelled"
            );
        } else {
            info!(job_id, dispatched = report.dispatched, "Dispatch pass finished");
        }
        report
    }
}

/// Sleeps for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

struct UnitCall {
    pass: u32,
    executor: Arc<dyn UnitExecutor>,
    ledger: LedgerHandle,
    metrics: Metrics,
    request: UnitRequest,
}

impl UnitCall {
    async fn run(self) {
        let job_id = self.request.job_id.clone();
        let unit = self.request.unit.clone();

        let recorded = match self.executor.execute(self.request).await {
            Ok(response) if response.success => {
                self.metrics.unit_succeeded(response.items_processed);
                self.ledger
                    .record_success(&job_id, self.pass, &unit, response.items_processed)
                    .await
            }
            Ok(response) => {
                self.metrics.unit_failed();
                let error = response
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string());
                self.ledger.record_failure(&job_id, self.pass, &unit, error).await
            }
            Err(e) => {
                self.metrics.unit_failed();
                self.ledger
                    .record_failure(&job_id, self.pass, &unit, e.to_string())
                    .await
            }
        };

        if let Err(e) = recorded {
            error!(job_id = %job_id, unit = %unit, error = %e, "Could not record unit outcome");
        }
    }
}
