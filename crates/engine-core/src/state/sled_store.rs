use crate::{error::StoreError, state::JobStore};
use async_trait::async_trait;
use model::job::JobRecord;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;

pub struct SledJobStore {
    db: sled::Db,
}

impl SledJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database removed on drop. Used by tests and dry runs.
    pub fn temporary() -> Result<Self, sled::Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    #[inline]
    fn job_key(job_id: &str) -> String {
        format!("job:{}", job_id)
    }

    fn decode(bytes: &[u8]) -> Result<JobRecord, StoreError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[async_trait]
impl JobStore for SledJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        let key = Self::job_key(&job.id);
        let bytes = bincode::serialize(job)?;

        let result = self.db.transaction::<_, _, StoreError>(|tx_db| {
            if tx_db.get(key.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    StoreError::AlreadyExists(job.id.clone()),
                ));
            }
            tx_db.insert(key.as_bytes(), bytes.as_slice())?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
        }
    }

    async fn load(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        match self.db.get(Self::job_key(job_id))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn swap(&self, expected_version: u64, next: &JobRecord) -> Result<bool, StoreError> {
        let key = Self::job_key(&next.id);
        let new_bytes = bincode::serialize(next)?;

        // Check-then-set inside one transaction so a concurrent writer that
        // bumped the version in between makes this update a no-op.
        let result = self.db.transaction::<_, _, StoreError>(|tx_db| {
            let Some(existing_bytes) = tx_db.get(key.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(StoreError::NotFound(
                    next.id.clone(),
                )));
            };

            let existing: JobRecord = bincode::deserialize(&existing_bytes)
                .map_err(|e| ConflictableTransactionError::Abort(StoreError::Codec(e)))?;

            if existing.version != expected_version {
                return Ok(false);
            }

            tx_db.insert(key.as_bytes(), new_bytes.as_slice())?;
            Ok(true)
        });

        match result {
            Ok(swapped) => Ok(swapped),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
        }
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = Vec::new();
        for item in self.db.scan_prefix("job:") {
            let (_key, value) = item?;
            jobs.push(Self::decode(&value)?);
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.db.remove(Self::job_key(job_id))?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::job::{JobConfig, JobDefinition, JobKind, JobStatus};
    use tempfile::tempdir;

    fn job(id: &str) -> JobRecord {
        JobRecord::new(JobDefinition {
            id: Some(id.to_string()),
            name: id.to_string(),
            kind: JobKind::Partitioned,
            config: JobConfig::default(),
            schedule: None,
        })
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = SledJobStore::temporary().unwrap();
        store.insert(&job("a")).await.unwrap();

        let err = store.insert(&job("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "a"));
    }

    #[tokio::test]
    async fn swap_refuses_stale_version() {
        let store = SledJobStore::temporary().unwrap();
        let original = job("a");
        store.insert(&original).await.unwrap();

        let mut first = original.clone();
        first.version = 1;
        first.status = JobStatus::Running;
        assert!(store.swap(0, &first).await.unwrap());

        // A writer still holding version 0 must not clobber the update.
        let mut stale = original.clone();
        stale.version = 1;
        stale.stop_requested = true;
        assert!(!store.swap(0, &stale).await.unwrap());

        let persisted = store.load("a").await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Running);
        assert!(!persisted.stop_requested);
    }

    #[tokio::test]
    async fn swap_on_missing_job_is_not_found() {
        let store = SledJobStore::temporary().unwrap();
        let err = store.swap(0, &job("ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SledJobStore::open(dir.path()).unwrap();
            store.insert(&job("a")).await.unwrap();
            store.insert(&job("b")).await.unwrap();
            store.db.flush().unwrap();
        }

        let store = SledJobStore::open(dir.path()).unwrap();
        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));

        assert!(store.remove("a").await.unwrap());
        assert!(store.load("a").await.unwrap().is_none());
    }
}
