use crate::error::StoreError;
use async_trait::async_trait;
use model::job::JobRecord;

pub mod job_state;
pub mod sled_store;

/// Persistent record store keyed by job id.
///
/// Writers never blindly overwrite: `swap` only succeeds when the persisted
/// record still carries `expected_version`, so read-modify-write cycles from
/// different actors cannot lose each other's updates.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new record. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn load(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Conditionally replaces the record. Returns `false` on a version conflict.
    async fn swap(&self, expected_version: u64, next: &JobRecord) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    async fn remove(&self, job_id: &str) -> Result<bool, StoreError>;
}
