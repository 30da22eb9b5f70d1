//! Order Status Board
//!
//! Accepted orders are answered before they are written, so a late
//! persistence fault would otherwise be invisible to the buyer. The board
//! records where each accepted order ended up; callers poll it by order id.
//!
//! Pending orders are always tracked. Finished ones (persisted or failed)
//! are kept for the most recent `retention` orders only, oldest evicted
//! first, so a long-running process does not grow without bound.

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Finished orders kept for polling by default
pub const DEFAULT_STATUS_RETENTION: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum OrderStatus {
    /// Admitted and queued, not yet written
    Pending,
    /// Order row written
    Persisted,
    /// Admitted but never written
    Failed { reason: String },
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

#[derive(Debug)]
pub struct OrderStatusBoard {
    entries: DashMap<u64, OrderStatus>,
    /// Finished order ids, oldest first
    finished: Mutex<VecDeque<u64>>,
    retention: usize,
}

impl Default for OrderStatusBoard {
    fn default() -> Self {
        Self::with_retention(DEFAULT_STATUS_RETENTION)
    }
}

impl OrderStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` finished orders.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn mark_pending(&self, order_id: u64) {
        self.entries.insert(order_id, OrderStatus::Pending);
    }

    pub fn mark_persisted(&self, order_id: u64) {
        self.finish(order_id, OrderStatus::Persisted);
    }

    pub fn mark_failed(&self, order_id: u64, reason: impl Into<String>) {
        self.finish(
            order_id,
            OrderStatus::Failed {
                reason: reason.into(),
            },
        );
    }

    fn finish(&self, order_id: u64, status: OrderStatus) {
        let mut finished = self.finished.lock();
        if let Some(previous) = self.entries.insert(order_id, status) {
            if previous.is_terminal() {
                return;
            }
        }
        finished.push_back(order_id);

        while finished.len() > self.retention {
            let Some(oldest) = finished.pop_front() else {
                break;
            };
            self.entries.remove_if(&oldest, |_, status| status.is_terminal());
        }
    }

    /// Drop an order that was never queued.
    pub fn forget(&self, order_id: u64) {
        self.entries.remove(&order_id);
    }

    pub fn get(&self, order_id: u64) -> Option<OrderStatus> {
        self.entries.get(&order_id).map(|s| s.value().clone())
    }

    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| *e.value() == OrderStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
