#![allow(dead_code)]

use engine_config::settings::{
    CursorLoopSettings, DispatchPolicy, OrchestratorSettings, PollerSettings,
};
use engine_core::state::{JobStore, sled_store::SledJobStore};
use engine_runtime::orchestrator::Orchestrator;
use model::{
    job::{JobConfig, JobDefinition, JobKind},
    unit::{Dimension, PartitionRanges},
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

pub mod executors;

/// Sled database in a temporary directory. The directory lives as long as this value.
pub struct TestStore {
    pub store: Arc<dyn JobStore>,
    _dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = SledJobStore::open(dir.path().join("state")).expect("open sled store");
        TestStore {
            store: Arc::new(store),
            _dir: dir,
        }
    }

    /// A fresh orchestrator instance over the shared store, as a restarted
    /// process would see it.
    pub fn orchestrator(&self, settings: OrchestratorSettings) -> Orchestrator {
        Orchestrator::new(self.store.clone(), settings)
    }
}

/// Production constants scaled down to milliseconds.
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        dispatch: DispatchPolicy {
            batch_size: 2,
            stagger: Duration::from_millis(1),
            batch_delay: Duration::from_millis(2),
            max_concurrent: 4,
        },
        poller: PollerSettings {
            interval: Duration::from_millis(5),
            ceiling: Duration::from_secs(10),
        },
        cursor: CursorLoopSettings {
            batch_size: 10,
            pacing: Duration::from_millis(1),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            max_empty_batches: 3,
            max_batches: 10_000,
        },
        ..Default::default()
    }
}

/// language [en, de] x year [2021, 2022] x category [film].
pub fn catalog_ranges() -> PartitionRanges {
    PartitionRanges::default()
        .with(Dimension::new("language", ["en", "de"]))
        .with(Dimension::years(2021, 2022))
        .with(Dimension::new("category", ["film"]))
}

pub fn partitioned_job(id: &str, ranges: PartitionRanges) -> JobDefinition {
    JobDefinition {
        id: Some(id.to_string()),
        name: format!("{id} refresh"),
        kind: JobKind::Partitioned,
        config: JobConfig {
            ranges,
            ..Default::default()
        },
        schedule: None,
    }
}

pub fn cursor_job(id: &str, batch_size: u32) -> JobDefinition {
    JobDefinition {
        id: Some(id.to_string()),
        name: format!("{id} backfill"),
        kind: JobKind::Cursor,
        config: JobConfig {
            batch_size,
            ..Default::default()
        },
        schedule: None,
    }
}
