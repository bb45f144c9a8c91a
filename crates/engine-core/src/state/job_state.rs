use crate::{error::StoreError, state::JobStore};
use chrono::Utc;
use model::job::JobRecord;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_MAX_CONFLICTS: usize = 32;

/// Read-merge-write access to job records on top of a [`JobStore`].
///
/// Every update re-reads the persisted record, applies the caller's change to
/// that fresh copy and writes it back conditioned on the version it read. On a
/// conflict the cycle repeats, so a field written concurrently by another actor
/// (e.g. the stop flag) survives.
#[derive(Clone)]
pub struct JobState {
    store: Arc<dyn JobStore>,
    max_conflicts: usize,
}

impl JobState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            max_conflicts: DEFAULT_MAX_CONFLICTS,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.store.insert(job).await
    }

    pub async fn load(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        self.store
            .load(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.store.list().await
    }

    /// Applies `change` to the latest persisted record and stores the result.
    pub async fn modify<F, T>(&self, job_id: &str, mut change: F) -> Result<(JobRecord, T), StoreError>
    where
        F: FnMut(&mut JobRecord) -> T + Send,
        T: Send,
    {
        self.try_modify::<_, _, StoreError>(job_id, |job| Ok(change(job)))
            .await
    }

    /// Like [`JobState::modify`], but `change` may veto the write by returning an error.
    pub async fn try_modify<F, T, E>(&self, job_id: &str, mut change: F) -> Result<(JobRecord, T), E>
    where
        F: FnMut(&mut JobRecord) -> Result<T, E> + Send,
        T: Send,
        E: From<StoreError> + Send,
    {
        for attempt in 1..=self.max_conflicts {
            let current = self.load(job_id).await?;
            let mut next = current.clone();
            let out = change(&mut next)?;

            next.version = current.version + 1;
            next.updated_at = Utc::now();

            if self.store.swap(current.version, &next).await? {
                return Ok((next, out));
            }

            debug!(job_id, attempt, "Job record changed concurrently, retrying update");
        }

        Err(StoreError::Conflict {
            job_id: job_id.to_string(),
            attempts: self.max_conflicts,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sled_store::SledJobStore;
    use model::{
        job::{JobConfig, JobDefinition, JobKind, JobStatus},
        unit::WorkUnit,
    };

    fn state_with(id: &str) -> (JobState, JobRecord) {
        let store: Arc<dyn JobStore> = Arc::new(SledJobStore::temporary().unwrap());
        let job = JobRecord::new(JobDefinition {
            id: Some(id.to_string()),
            name: id.to_string(),
            kind: JobKind::Partitioned,
            config: JobConfig::default(),
            schedule: None,
        });
        (JobState::new(store), job)
    }

    #[tokio::test]
    async fn modify_bumps_version() {
        let (state, job) = state_with("a");
        state.insert(&job).await.unwrap();

        let (updated, ()) = state
            .modify("a", |j| j.status = JobStatus::Running)
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(state.load("a").await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn concurrent_ledger_writes_are_not_lost() {
        let (state, mut job) = state_with("a");
        job.ledger.total_units = 20;
        state.insert(&job).await.unwrap();

        let mut handles = Vec::new();
        for idx in 0..20 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let unit = WorkUnit::from_pairs([("n", idx.to_string())]);
                state
                    .modify("a", |j| j.ledger.record_success(&unit, 1, Utc::now()))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let job = state.load("a").await.unwrap();
        assert_eq!(job.ledger.completed_count(), 20);
        assert!(job.ledger.is_converged());
    }

    #[tokio::test]
    async fn stop_flag_survives_ledger_merge() {
        let (state, job) = state_with("a");
        state.insert(&job).await.unwrap();

        state.modify("a", |j| j.stop_requested = true).await.unwrap();
        state
            .modify("a", |j| {
                j.ledger
                    .record_failure(&WorkUnit::from_pairs([("n", "1")]), "boom", Utc::now())
            })
            .await
            .unwrap();

        let job = state.load("a").await.unwrap();
        assert!(job.stop_requested);
        assert_eq!(job.ledger.failed_count(), 1);
    }

    #[tokio::test]
    async fn try_modify_veto_leaves_record_untouched() {
        let (state, job) = state_with("a");
        state.insert(&job).await.unwrap();

        let result: Result<(JobRecord, ()), StoreError> = state
            .try_modify("a", |_| Err(StoreError::AlreadyExists("a".into())))
            .await;
        assert!(result.is_err());
        assert_eq!(state.load("a").await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let (state, _) = state_with("a");
        let err = state.modify("nope", |_| ()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
