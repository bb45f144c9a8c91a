use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct Counters {
    units_dispatched: AtomicU64,
    units_succeeded: AtomicU64,
    units_failed: AtomicU64,
    cursor_batches: AtomicU64,
    items_processed: AtomicU64,
    retry_count: AtomicU64,
    polls: AtomicU64,
}

/// Counters shared by the dispatcher, poller and cursor loop of one
/// orchestrator. Cloning shares the same counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    counters: Arc<Counters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub units_dispatched: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    pub cursor_batches: u64,
    pub items_processed: u64,
    pub retry_count: u64,
    pub polls: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit_dispatched(&self) {
        bump(&self.counters.units_dispatched, 1);
    }

    pub fn unit_succeeded(&self, items_processed: u64) {
        bump(&self.counters.units_succeeded, 1);
        bump(&self.counters.items_processed, items_processed);
    }

    pub fn unit_failed(&self) {
        bump(&self.counters.units_failed, 1);
    }

    pub fn cursor_batch(&self, items_processed: u64) {
        bump(&self.counters.cursor_batches, 1);
        bump(&self.counters.items_processed, items_processed);
    }

    /// Calls beyond the first spent on one cursor iteration, recovered or not.
    pub fn cursor_retries(&self, retries: u64) {
        bump(&self.counters.retry_count, retries);
    }

    pub fn poll(&self) {
        bump(&self.counters.polls, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            units_dispatched: c.units_dispatched.load(Ordering::Relaxed),
            units_succeeded: c.units_succeeded.load(Ordering::Relaxed),
            units_failed: c.units_failed.load(Ordering::Relaxed),
            cursor_batches: c.cursor_batches.load(Ordering::Relaxed),
            items_processed: c.items_processed.load(Ordering::Relaxed),
            retry_count: c.retry_count.load(Ordering::Relaxed),
            polls: c.polls.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    if by > 0 {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}
