//! Order Pipeline Metrics

use std::sync::atomic::{AtomicU64, Ordering};

use super::task::{PersistOutcome, RejectReason};

/// Pipeline counters
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // Admission
    submitted: AtomicU64,
    accepted: AtomicU64,
    rejected_out_of_stock: AtomicU64,
    rejected_duplicate: AtomicU64,
    rejected_window: AtomicU64,
    queue_full: AtomicU64,
    reverted: AtomicU64,

    // Persistence
    persisted: AtomicU64,
    lock_busy: AtomicU64,
    already_ordered: AtomicU64,
    stock_exhausted: AtomicU64,
    persist_errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::OutOfStock => &self.rejected_out_of_stock,
            RejectReason::DuplicatePurchase => &self.rejected_duplicate,
            RejectReason::NotStarted | RejectReason::Ended => &self.rejected_window,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reverted(&self) {
        self.reverted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: PersistOutcome) {
        let counter = match outcome {
            PersistOutcome::Persisted => &self.persisted,
            PersistOutcome::LockBusy => &self.lock_busy,
            PersistOutcome::AlreadyOrdered => &self.already_ordered,
            PersistOutcome::StockExhausted => &self.stock_exhausted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_error(&self) {
        self.persist_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_out_of_stock: self.rejected_out_of_stock.load(Ordering::Relaxed),
            rejected_duplicate: self.rejected_duplicate.load(Ordering::Relaxed),
            rejected_window: self.rejected_window.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            reverted: self.reverted.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            lock_busy: self.lock_busy.load(Ordering::Relaxed),
            already_ordered: self.already_ordered.load(Ordering::Relaxed),
            stock_exhausted: self.stock_exhausted.load(Ordering::Relaxed),
            persist_errors: self.persist_errors.load(Ordering::Relaxed),
            tracked_orders: 0,
        }
    }
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected_out_of_stock: u64,
    pub rejected_duplicate: u64,
    pub rejected_window: u64,
    pub queue_full: u64,
    pub reverted: u64,
    pub persisted: u64,
    pub lock_busy: u64,
    pub already_ordered: u64,
    pub stock_exhausted: u64,
    pub persist_errors: u64,
    /// Orders on the status board; filled in by the pipeline
    pub tracked_orders: u64,
}

impl PipelineMetricsSnapshot {
    /// Accepted orders that were never written
    pub fn persist_faults(&self) -> u64 {
        self.lock_busy + self.already_ordered + self.stock_exhausted + self.persist_errors
    }
}
