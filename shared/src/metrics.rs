use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Items
    pub items_enqueued: AtomicU64,
    pub items_acknowledged: AtomicU64,
    pub items_rejected: AtomicU64,
    pub items_expired: AtomicU64,

    // Cycles
    pub cycles_started: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub batches_sent: AtomicU64,
    pub triggers_coalesced: AtomicU64,
    pub retries_scheduled: AtomicU64,

    pub storage_errors: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_acknowledged: self.items_acknowledged.load(Ordering::Relaxed),
            items_rejected: self.items_rejected.load(Ordering::Relaxed),
            items_expired: self.items_expired.load(Ordering::Relaxed),
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            triggers_coalesced: self.triggers_coalesced.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub items_enqueued: u64,
    pub items_acknowledged: u64,
    pub items_rejected: u64,
    pub items_expired: u64,
    pub cycles_started: u64,
    pub cycles_failed: u64,
    pub batches_sent: u64,
    pub triggers_coalesced: u64,
    pub retries_scheduled: u64,
    pub storage_errors: u64,
}
