use crate::unit::WorkUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompletedUnit {
    pub unit: WorkUnit,
    pub items_processed: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailedUnit {
    pub unit: WorkUnit,
    pub error: String,
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
}

/// Result of merging a single outcome into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerChange {
    /// The unit moved into a new settled set.
    Applied,
    /// The outcome was a duplicate or arrived for an already-settled unit.
    Ignored,
}

impl LedgerChange {
    pub fn is_applied(self) -> bool {
        matches!(self, LedgerChange::Applied)
    }
}

/// Persisted progress of a partitioned job.
///
/// Every unit of the current pass is in exactly one of: pending (implicit),
/// `completed`, `failed`. Sets are keyed by [`WorkUnit::key`].
///
/// `total_units` counts the units in scope: the members of the current pass
/// plus every unit settled outside it. Each settled unit is in scope, so
/// `completed + failed <= total_units`, with equality exactly when every
/// member of the pass has settled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Ledger {
    pub total_units: u64,
    /// Generation of the current dispatch pass. Bumped by every pass.
    pub pass: u32,
    /// Keys dispatched by a narrowed pass (retry or resume). `None` while the
    /// pass spans the whole partition.
    pub members: Option<BTreeSet<String>>,
    pub completed: BTreeMap<String, CompletedUnit>,
    pub failed: BTreeMap<String, FailedUnit>,
    /// Advisory only; never used to decide convergence.
    pub in_flight: BTreeMap<String, WorkUnit>,
    /// Attempt history per unit key. Survives clearing `failed` for a retry pass.
    pub attempts: BTreeMap<String, u32>,
}

/// Immutable counts handed to observers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub remaining: u64,
    pub in_flight: u64,
    pub items_processed: u64,
}

impl LedgerSnapshot {
    pub fn is_converged(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

impl Ledger {
    pub fn new(total_units: u64) -> Self {
        Ledger {
            total_units,
            ..Default::default()
        }
    }

    /// Empty ledger for a fresh run over `total_units`. The generation moves
    /// on so results still arriving from earlier passes are recognised.
    pub fn next_run(&self, total_units: u64) -> Self {
        Ledger {
            total_units,
            pass: self.pass + 1,
            ..Default::default()
        }
    }

    pub fn is_member(&self, key: &str) -> bool {
        self.members.as_ref().is_none_or(|m| m.contains(key))
    }

    /// A failure reported by an earlier pass for a unit the current pass has
    /// dispatched again. Only the current call decides that unit's outcome.
    pub fn is_superseded(&self, pass: u32, unit: &WorkUnit) -> bool {
        pass < self.pass && self.is_member(&unit.key())
    }

    /// A pending unit outside the pass is settling late; it joins the scope.
    fn admit(&mut self, key: &str) {
        if !self.is_member(key) {
            self.total_units += 1;
        }
    }

    pub fn mark_in_flight(&mut self, unit: &WorkUnit) {
        let key = unit.key();
        if self.completed.contains_key(&key) || self.failed.contains_key(&key) {
            return;
        }
        self.in_flight.insert(key, unit.clone());
    }

    /// Moves `unit` into `completed`. Idempotent for an already-completed unit.
    pub fn record_success(
        &mut self,
        unit: &WorkUnit,
        items_processed: u64,
        at: DateTime<Utc>,
    ) -> LedgerChange {
        let key = unit.key();
        self.in_flight.remove(&key);

        if self.completed.contains_key(&key) {
            return LedgerChange::Ignored;
        }

        if self.failed.remove(&key).is_none() {
            self.admit(&key);
        }
        self.completed.insert(
            key,
            CompletedUnit {
                unit: unit.clone(),
                items_processed,
                completed_at: at,
            },
        );
        LedgerChange::Applied
    }

    /// Moves `unit` into `failed`, bumping its attempt counter.
    ///
    /// A failure reported for a unit that already completed is a late duplicate
    /// and leaves the ledger unchanged.
    pub fn record_failure(
        &mut self,
        unit: &WorkUnit,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> LedgerChange {
        let key = unit.key();
        self.in_flight.remove(&key);

        if self.completed.contains_key(&key) {
            return LedgerChange::Ignored;
        }

        if !self.failed.contains_key(&key) {
            self.admit(&key);
        }

        let attempts = self.attempts.entry(key.clone()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;

        self.failed.insert(
            key,
            FailedUnit {
                unit: unit.clone(),
                error: error.into(),
                attempts,
                last_attempt_at: at,
            },
        );
        LedgerChange::Applied
    }

    /// Clears `failed` ahead of a retry pass and narrows the pass to the
    /// retried units. Returns the units to dispatch again.
    pub fn take_failed_for_retry(&mut self) -> Vec<WorkUnit> {
        let failed = std::mem::take(&mut self.failed);
        let units: Vec<WorkUnit> = failed.into_values().map(|f| f.unit).collect();
        self.begin_pass(&units);
        units
    }

    /// Starts a pass over `pending`, the part of the partition not completed yet.
    pub fn reset_for_resume(&mut self, pending: &[WorkUnit]) {
        self.begin_pass(pending);
    }

    fn begin_pass(&mut self, units: &[WorkUnit]) {
        let members: BTreeSet<String> = units.iter().map(WorkUnit::key).collect();
        let settled_outside = self
            .completed
            .keys()
            .chain(self.failed.keys())
            .filter(|key| !members.contains(*key))
            .count();
        self.pass += 1;
        self.in_flight.clear();
        self.total_units = (settled_outside + members.len()) as u64;
        self.members = Some(members);
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.len() as u64
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.len() as u64
    }

    pub fn attempts_for(&self, unit: &WorkUnit) -> u32 {
        self.attempts.get(&unit.key()).copied().unwrap_or(0)
    }

    pub fn is_completed(&self, unit: &WorkUnit) -> bool {
        self.completed.contains_key(&unit.key())
    }

    /// Sum of items reported by completed units. Each unit contributes once.
    pub fn items_processed(&self) -> u64 {
        self.completed.values().map(|c| c.items_processed).sum()
    }

    pub fn is_converged(&self) -> bool {
        self.completed_count() + self.failed_count() == self.total_units
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let completed = self.completed_count();
        let failed = self.failed_count();
        LedgerSnapshot {
            total: self.total_units,
            completed,
            failed,
            remaining: self.total_units.saturating_sub(completed + failed),
            in_flight: self.in_flight.len() as u64,
            items_processed: self.items_processed(),
        }
    }
}
