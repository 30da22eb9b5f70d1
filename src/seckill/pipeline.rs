//! Seckill Order Pipeline
//!
//! Two phases on one component:
//!
//! ```text
//! submit ──► admission script ──► mint id ──► queue ──► consumer
//!                (store)                                  │
//!                                            per-user lock + transaction
//!                                                         │
//!                                                  create_voucher_order
//! ```
//!
//! Admission answers the caller as soon as the task is queued. A single
//! consumer drains the queue in FIFO order and calls
//! [`SeckillPipeline::create_voucher_order`] for each task; the outcome is
//! recorded on the [`OrderStatusBoard`] and published as a domain event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
use super::status::{OrderStatus, OrderStatusBoard, DEFAULT_STATUS_RETENTION};
use super::task::{AdmissionResult, PersistOutcome, RejectReason, SeckillTask};
use crate::coordination::{DistributedLock, IdGenerator};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    AdmissionCode, EventPublisher, KeyValueStore, OrderRepository, SeckillVoucher, VoucherOrder,
};
use crate::error::{Error, Result};
use crate::keys;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Admitted tasks the queue holds before new admissions are reverted
    pub queue_capacity: usize,
    /// Lifetime of the per-user order lock
    pub order_lock_ttl: Duration,
    /// Finished orders whose status stays available to `order_status`
    pub status_retention: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024 * 1024,
            order_lock_ttl: keys::LOCK_ORDER_TTL,
            status_retention: DEFAULT_STATUS_RETENTION,
        }
    }
}

/// Flash-sale admission and order persistence.
pub struct SeckillPipeline {
    store: Arc<dyn KeyValueStore>,
    orders: Arc<dyn OrderRepository>,
    events: Arc<dyn EventPublisher>,
    ids: IdGenerator,
    lock: DistributedLock,
    config: PipelineConfig,

    /// Sale windows of published vouchers
    windows: DashMap<u64, SeckillVoucher>,

    status: OrderStatusBoard,
    metrics: PipelineMetrics,

    /// Queue producer; `None` once intake is closed
    intake: RwLock<Option<mpsc::Sender<SeckillTask>>>,

    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SeckillPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeckillPipeline")
            .field("config", &self.config)
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

impl SeckillPipeline {
    /// Build the pipeline and spawn its consumer.
    ///
    /// The consumer runs until [`SeckillPipeline::shutdown`] is called.
    pub fn start(
        store: Arc<dyn KeyValueStore>,
        orders: Arc<dyn OrderRepository>,
        events: Arc<dyn EventPublisher>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let status = OrderStatusBoard::with_retention(config.status_retention);

        let pipeline = Arc::new(Self {
            ids: IdGenerator::new(Arc::clone(&store)),
            lock: DistributedLock::new(Arc::clone(&store)),
            store,
            orders,
            events,
            config,
            windows: DashMap::new(),
            status,
            metrics: PipelineMetrics::new(),
            intake: RwLock::new(Some(tx)),
            consumer: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&pipeline).run(rx));
        *pipeline.consumer.lock() = Some(handle);
        pipeline
    }

    // =========================================================================
    // Voucher Publication
    // =========================================================================

    /// Save a voucher, seed its stock in the store and register its window.
    #[instrument(skip(self, voucher), fields(voucher_id = voucher.voucher_id))]
    pub async fn publish_voucher(&self, voucher: &SeckillVoucher) -> Result<()> {
        if voucher.voucher_id == 0 {
            return Err(Error::Validation("voucher id must be non-zero".into()));
        }
        if voucher.stock < 0 {
            return Err(Error::Validation(format!(
                "voucher {} has negative stock {}",
                voucher.voucher_id, voucher.stock
            )));
        }
        if voucher.end_time < voucher.begin_time {
            return Err(Error::Validation(format!(
                "voucher {} ends before it begins",
                voucher.voucher_id
            )));
        }

        self.orders.save_seckill_voucher(voucher).await?;
        self.store
            .set(
                &keys::seckill_stock_key(voucher.voucher_id),
                &voucher.stock.to_string(),
                None,
            )
            .await?;
        self.windows.insert(voucher.voucher_id, voucher.clone());

        info!(
            voucher_id = voucher.voucher_id,
            stock = voucher.stock,
            begin = %voucher.begin_time,
            end = %voucher.end_time,
            "Seckill voucher published"
        );
        Ok(())
    }

    fn window_rejection(&self, voucher_id: u64, now: DateTime<Utc>) -> Option<RejectReason> {
        let voucher = self.windows.get(&voucher_id)?;
        if voucher.is_open_at(now) {
            None
        } else if now < voucher.begin_time {
            Some(RejectReason::NotStarted)
        } else {
            Some(RejectReason::Ended)
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Try to buy `voucher_id` for `user_id`.
    ///
    /// Rejections are `Ok(AdmissionResult::Rejected)`. An accepted order is
    /// only queued; poll [`SeckillPipeline::order_status`] for the outcome.
    #[instrument(skip(self))]
    pub async fn submit(&self, voucher_id: u64, user_id: u64) -> Result<AdmissionResult> {
        if voucher_id == 0 || user_id == 0 {
            return Err(Error::Validation(format!(
                "voucher id and user id must be non-zero (voucher {}, user {})",
                voucher_id, user_id
            )));
        }
        self.metrics.record_submitted();

        if let Some(reason) = self.window_rejection(voucher_id, Utc::now()) {
            return Ok(self.reject(reason));
        }
        if self.intake.read().is_none() {
            return Err(Error::ShuttingDown);
        }

        match self.store.seckill_admit(voucher_id, user_id).await? {
            AdmissionCode::Accepted => {}
            AdmissionCode::OutOfStock => return Ok(self.reject(RejectReason::OutOfStock)),
            AdmissionCode::Duplicate => return Ok(self.reject(RejectReason::DuplicatePurchase)),
        }

        let order_id = match self.ids.next_id(keys::ORDER_ID_BUSINESS_KEY).await {
            Ok(id) => id,
            Err(e) => {
                self.revert_admission(voucher_id, user_id).await;
                return Err(e);
            }
        };

        let task = SeckillTask {
            order_id,
            user_id,
            voucher_id,
        };
        self.status.mark_pending(order_id);
        if let Err(e) = self.enqueue(task) {
            self.status.forget(order_id);
            self.revert_admission(voucher_id, user_id).await;
            if matches!(e, Error::QueueFull { .. }) {
                self.metrics.record_queue_full();
                warn!(order_id, user_id, voucher_id, "Order queue full; admission reverted");
            }
            return Err(e);
        }

        self.metrics.record_accepted();
        info!(order_id, user_id, voucher_id, "Order admitted");
        if let Err(e) = self
            .events
            .publish(DomainEvent::order_admitted(order_id, user_id, voucher_id))
            .await
        {
            warn!(order_id, error = %e, "Failed to publish admission event");
        }

        Ok(AdmissionResult::Accepted { order_id })
    }

    fn reject(&self, reason: RejectReason) -> AdmissionResult {
        self.metrics.record_rejected(reason);
        debug!(?reason, "Purchase rejected");
        AdmissionResult::Rejected { reason }
    }

    fn enqueue(&self, task: SeckillTask) -> Result<()> {
        let intake = self.intake.read();
        let tx = intake.as_ref().ok_or(Error::ShuttingDown)?;
        tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull {
                capacity: self.config.queue_capacity,
            },
            TrySendError::Closed(_) => Error::ShuttingDown,
        })
    }

    async fn revert_admission(&self, voucher_id: u64, user_id: u64) {
        match self.store.seckill_revert(voucher_id, user_id).await {
            Ok(()) => self.metrics.record_reverted(),
            Err(e) => error!(
                voucher_id,
                user_id,
                error = %e,
                "Failed to revert admission; store stock is now under-counted"
            ),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Consumer loop. Ends once intake is closed and the queue is empty.
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<SeckillTask>) {
        info!(
            capacity = self.config.queue_capacity,
            "Order consumer started"
        );

        while let Some(task) = rx.recv().await {
            self.handle_task(task).await;
        }

        info!("Order queue drained; consumer stopped");
    }

    async fn handle_task(&self, task: SeckillTask) {
        let outcome = AssertUnwindSafe(self.create_voucher_order(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Internal("order persistence panicked".into())));

        let event = match outcome {
            Ok(outcome) if !outcome.is_fault() => {
                self.metrics.record_outcome(outcome);
                self.status.mark_persisted(task.order_id);
                debug!(order_id = task.order_id, "Order persisted");
                DomainEvent::order_persisted(task.order_id, task.user_id, task.voucher_id)
            }
            Ok(fault) => {
                self.metrics.record_outcome(fault);
                self.persist_fault(&task, fault.describe())
            }
            Err(e) => {
                self.metrics.record_persist_error();
                if e.is_transient() {
                    warn!(order_id = task.order_id, "Persistence dependency unavailable");
                }
                self.persist_fault(&task, &e.to_string())
            }
        };

        if let Err(e) = self.events.publish(event).await {
            warn!(order_id = task.order_id, error = %e, "Failed to publish order event");
        }
    }

    fn persist_fault(&self, task: &SeckillTask, reason: &str) -> DomainEvent {
        error!(
            order_id = task.order_id,
            user_id = task.user_id,
            voucher_id = task.voucher_id,
            reason,
            "Admitted order was not persisted"
        );
        self.status.mark_failed(task.order_id, reason);
        DomainEvent::order_persist_failed(task.order_id, task.user_id, task.voucher_id, reason)
    }

    /// Write one admitted order.
    ///
    /// Takes the user's order lock without waiting, then in one transaction
    /// re-checks for an existing order on `(voucher, user)`, decrements the
    /// durable stock behind its `stock > 0` guard and inserts the row. The
    /// lock is released whatever happens.
    #[instrument(skip(self, task), fields(order_id = task.order_id, user_id = task.user_id))]
    pub async fn create_voucher_order(&self, task: &SeckillTask) -> Result<PersistOutcome> {
        let lock_key = keys::order_lock_key(task.user_id);
        let handle = match self
            .lock
            .try_acquire(&lock_key, self.config.order_lock_ttl)
            .await?
        {
            Some(handle) => handle,
            None => return Ok(PersistOutcome::LockBusy),
        };

        let outcome = self.persist_in_transaction(task).await;

        if let Err(e) = self.lock.release(handle).await {
            warn!(lock = %lock_key, error = %e, "Failed to release order lock");
        }
        outcome
    }

    async fn persist_in_transaction(&self, task: &SeckillTask) -> Result<PersistOutcome> {
        // Returning early drops `tx`, which rolls it back.
        let mut tx = self.orders.begin().await?;

        if tx.order_exists(task.voucher_id, task.user_id).await? {
            return Ok(PersistOutcome::AlreadyOrdered);
        }
        if !tx.decrement_stock(task.voucher_id).await? {
            return Ok(PersistOutcome::StockExhausted);
        }
        tx.insert_order(&VoucherOrder {
            id: task.order_id,
            user_id: task.user_id,
            voucher_id: task.voucher_id,
            created_at: Utc::now(),
        })
        .await?;
        tx.commit().await?;

        Ok(PersistOutcome::Persisted)
    }

    // =========================================================================
    // Introspection and Lifecycle
    // =========================================================================

    pub fn order_status(&self, order_id: u64) -> Option<OrderStatus> {
        self.status.get(order_id)
    }

    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.tracked_orders = self.status.len() as u64;
        snapshot
    }

    /// Tasks queued but not yet picked up by the consumer
    pub fn queue_depth(&self) -> usize {
        self.intake
            .read()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn is_accepting(&self) -> bool {
        self.intake.read().is_some()
    }

    /// Close intake, let the consumer finish every queued task, and wait
    /// for it. Later calls to `submit` fail with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) -> Result<()> {
        let sender = self.intake.write().take();
        drop(sender);

        let consumer = self.consumer.lock().take();
        if let Some(handle) = consumer {
            handle
                .await
                .map_err(|e| Error::Internal(format!("order consumer failed: {}", e)))?;
        }

        info!(pending = self.status.pending(), "Order pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryOrderRepository, InMemoryStore};
    use assert_matches::assert_matches;
    use chrono::Duration as ChronoDuration;

    struct Harness {
        store: Arc<InMemoryStore>,
        orders: Arc<InMemoryOrderRepository>,
        events: Arc<InMemoryEventCollector>,
        pipeline: Arc<SeckillPipeline>,
    }

    fn harness(config: PipelineConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let orders = Arc::new(InMemoryOrderRepository::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let pipeline = SeckillPipeline::start(
            store.clone(),
            orders.clone(),
            events.clone(),
            config,
        );
        Harness {
            store,
            orders,
            events,
            pipeline,
        }
    }

    fn open_voucher(voucher_id: u64, stock: i64) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher {
            voucher_id,
            stock,
            begin_time: now - ChronoDuration::hours(1),
            end_time: now + ChronoDuration::hours(1),
        }
    }

    async fn store_stock(store: &InMemoryStore, voucher_id: u64) -> Option<String> {
        store.get(&keys::seckill_stock_key(voucher_id)).await.unwrap()
    }

    #[tokio::test]
    async fn test_accepted_order_is_persisted() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 1)).await.unwrap();

        let result = h.pipeline.submit(1, 100).await.unwrap();
        let order_id = result.order_id().expect("accepted");
        h.pipeline.shutdown().await.unwrap();

        assert_eq!(h.pipeline.order_status(order_id), Some(OrderStatus::Persisted));
        let order = h.orders.find_order(order_id).await.unwrap().unwrap();
        assert_eq!((order.user_id, order.voucher_id), (100, 1));
        assert_eq!(h.orders.stock(1).await.unwrap(), Some(0));
        assert_eq!(store_stock(&h.store, 1).await.as_deref(), Some("0"));
        assert_eq!(h.events.events_for_order(order_id).len(), 2);
        assert!(h.store.get("lock:order:100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_user_twice_is_duplicate() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 5)).await.unwrap();

        assert!(h.pipeline.submit(1, 100).await.unwrap().is_accepted());
        assert_eq!(
            h.pipeline.submit(1, 100).await.unwrap(),
            AdmissionResult::Rejected {
                reason: RejectReason::DuplicatePurchase
            }
        );
        assert_eq!(store_stock(&h.store, 1).await.as_deref(), Some("4"));

        h.pipeline.shutdown().await.unwrap();
        assert_eq!(h.orders.orders_of(1, 100).await.len(), 1);
        assert_eq!(h.orders.stock(1).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_unpublished_voucher_is_out_of_stock() {
        let h = harness(PipelineConfig::default());
        assert_eq!(
            h.pipeline.submit(9, 1).await.unwrap().reject_reason(),
            Some(RejectReason::OutOfStock)
        );
        assert_eq!(h.pipeline.metrics().rejected_out_of_stock, 1);
    }

    #[tokio::test]
    async fn test_sale_window_is_enforced() {
        let h = harness(PipelineConfig::default());
        let now = Utc::now();

        let mut upcoming = open_voucher(1, 10);
        upcoming.begin_time = now + ChronoDuration::hours(1);
        upcoming.end_time = now + ChronoDuration::hours(2);
        h.pipeline.publish_voucher(&upcoming).await.unwrap();

        let mut finished = open_voucher(2, 10);
        finished.begin_time = now - ChronoDuration::hours(2);
        finished.end_time = now - ChronoDuration::hours(1);
        h.pipeline.publish_voucher(&finished).await.unwrap();

        assert_eq!(
            h.pipeline.submit(1, 5).await.unwrap().reject_reason(),
            Some(RejectReason::NotStarted)
        );
        assert_eq!(
            h.pipeline.submit(2, 5).await.unwrap().reject_reason(),
            Some(RejectReason::Ended)
        );
        assert_eq!(store_stock(&h.store, 1).await.as_deref(), Some("10"));
        assert_eq!(h.pipeline.metrics().rejected_window, 2);
    }

    #[tokio::test]
    async fn test_invalid_input() {
        let h = harness(PipelineConfig::default());
        assert_matches!(h.pipeline.submit(0, 1).await, Err(Error::Validation(_)));
        assert_matches!(h.pipeline.submit(1, 0).await, Err(Error::Validation(_)));
        assert_matches!(
            h.pipeline.publish_voucher(&open_voucher(1, -1)).await,
            Err(Error::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_error() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 1)).await.unwrap();
        h.store.set_available(false);
        assert_matches!(h.pipeline.submit(1, 100).await, Err(Error::Store(_)));
    }

    #[tokio::test]
    async fn test_full_queue_reverts_admission() {
        // The consumer cannot run on this single-threaded runtime until the
        // test yields, so the one-slot queue stays full.
        let h = harness(PipelineConfig {
            queue_capacity: 1,
            ..PipelineConfig::default()
        });
        h.pipeline.publish_voucher(&open_voucher(1, 5)).await.unwrap();

        assert!(h.pipeline.submit(1, 100).await.unwrap().is_accepted());
        assert_matches!(
            h.pipeline.submit(1, 200).await,
            Err(Error::QueueFull { capacity: 1 })
        );
        assert_eq!(store_stock(&h.store, 1).await.as_deref(), Some("4"));
        assert!(!h
            .store
            .set_members(&keys::seckill_order_key(1))
            .contains("200"));

        h.pipeline.shutdown().await.unwrap();
        let metrics = h.pipeline.metrics();
        assert_eq!(metrics.queue_full, 1);
        assert_eq!(metrics.reverted, 1);
        assert_eq!(h.orders.count_orders(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_and_closes_intake() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 50)).await.unwrap();

        let mut order_ids = Vec::new();
        for user in 1..=50 {
            order_ids.push(h.pipeline.submit(1, user).await.unwrap().order_id().unwrap());
        }
        h.pipeline.shutdown().await.unwrap();

        assert!(order_ids
            .iter()
            .all(|id| h.pipeline.order_status(*id) == Some(OrderStatus::Persisted)));
        assert_eq!(h.orders.count_orders(1).await.unwrap(), 50);
        assert_eq!(h.orders.stock(1).await.unwrap(), Some(0));

        assert!(!h.pipeline.is_accepting());
        assert_matches!(h.pipeline.submit(1, 999).await, Err(Error::ShuttingDown));
    }

    #[tokio::test]
    async fn test_order_ids_are_unique_and_increasing() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 20)).await.unwrap();

        let mut last = 0;
        for user in 1..=20 {
            let id = h.pipeline.submit(1, user).await.unwrap().order_id().unwrap();
            assert!(id > last);
            last = id;
        }
        h.pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_lock_busy_is_a_fault() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 1)).await.unwrap();
        h.store
            .set_if_absent("lock:order:100", "other-worker", Duration::from_secs(30))
            .await
            .unwrap();

        let task = SeckillTask {
            order_id: 1,
            user_id: 100,
            voucher_id: 1,
        };
        assert_eq!(
            h.pipeline.create_voucher_order(&task).await.unwrap(),
            PersistOutcome::LockBusy
        );
        assert_eq!(h.orders.count_orders(1).await.unwrap(), 0);
        assert_eq!(
            h.store.get("lock:order:100").await.unwrap().as_deref(),
            Some("other-worker")
        );
        h.pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_rechecks_existing_order() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 5)).await.unwrap();

        let first = SeckillTask {
            order_id: 1,
            user_id: 100,
            voucher_id: 1,
        };
        let retry = SeckillTask { order_id: 2, ..first };

        assert_eq!(
            h.pipeline.create_voucher_order(&first).await.unwrap(),
            PersistOutcome::Persisted
        );
        assert_eq!(
            h.pipeline.create_voucher_order(&retry).await.unwrap(),
            PersistOutcome::AlreadyOrdered
        );
        assert_eq!(h.orders.stock(1).await.unwrap(), Some(4));
        h.pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_durable_stock_guard() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 3)).await.unwrap();
        // Durable stock disagrees with the store
        h.orders.save_seckill_voucher(&open_voucher(1, 0)).await.unwrap();

        let order_id = h.pipeline.submit(1, 100).await.unwrap().order_id().unwrap();
        h.pipeline.shutdown().await.unwrap();

        assert_matches!(
            h.pipeline.order_status(order_id),
            Some(OrderStatus::Failed { .. })
        );
        assert_eq!(h.orders.count_orders(1).await.unwrap(), 0);
        assert_eq!(h.orders.stock(1).await.unwrap(), Some(0));
        assert_eq!(h.events.events_of_type("OrderPersistFailed").len(), 1);
        assert_eq!(h.pipeline.metrics().stock_exhausted, 1);
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back_and_releases_lock() {
        let h = harness(PipelineConfig::default());
        h.pipeline.publish_voucher(&open_voucher(1, 2)).await.unwrap();
        h.orders.fail_inserts(true);

        let task = SeckillTask {
            order_id: 1,
            user_id: 100,
            voucher_id: 1,
        };
        assert_matches!(
            h.pipeline.create_voucher_order(&task).await,
            Err(Error::Repository(_))
        );
        assert_eq!(h.orders.stock(1).await.unwrap(), Some(2));
        assert!(h.store.get("lock:order:100").await.unwrap().is_none());
        h.pipeline.shutdown().await.unwrap();
    }
}
