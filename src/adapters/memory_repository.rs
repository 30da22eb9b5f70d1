//! In-Memory Relational Adapters
//!
//! Table-backed implementations of [`OrderRepository`] and [`ShopRepository`].
//! Order transactions hold the table lock for their whole lifetime and write
//! in place, recording an undo entry per write. A transaction dropped
//! without commit replays its undo log, so it leaves no trace.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::ports::{
    OrderRepository, OrderTx, SeckillVoucher, Shop, ShopRepository, ShopType, VoucherOrder,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct OrderTables {
    vouchers: HashMap<u64, SeckillVoucher>,
    orders: HashMap<u64, VoucherOrder>,
    /// Unique index on `(voucher_id, user_id)`
    buyers: HashSet<(u64, u64)>,
}

impl OrderTables {
    fn has_order(&self, voucher_id: u64, user_id: u64) -> bool {
        self.buyers.contains(&(voucher_id, user_id))
    }

    fn undo(&mut self, write: Undo) {
        match write {
            Undo::StockDecremented(voucher_id) => {
                if let Some(voucher) = self.vouchers.get_mut(&voucher_id) {
                    voucher.stock += 1;
                }
            }
            Undo::OrderInserted(order_id) => {
                if let Some(order) = self.orders.remove(&order_id) {
                    self.buyers.remove(&(order.voucher_id, order.user_id));
                }
            }
        }
    }
}

/// Inverse of one transactional write
#[derive(Debug, Clone, Copy)]
enum Undo {
    StockDecremented(u64),
    OrderInserted(u64),
}

/// In-memory voucher and order tables.
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    tables: Arc<Mutex<OrderTables>>,
    fail_inserts: Arc<AtomicBool>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `insert_order` fail, to exercise rollback.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// All orders for `voucher_id` belonging to `user_id`.
    pub async fn orders_of(&self, voucher_id: u64, user_id: u64) -> Vec<VoucherOrder> {
        self.tables
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.voucher_id == voucher_id && o.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save_seckill_voucher(&self, voucher: &SeckillVoucher) -> Result<()> {
        self.tables
            .lock()
            .await
            .vouchers
            .insert(voucher.voucher_id, voucher.clone());
        Ok(())
    }

    async fn stock(&self, voucher_id: u64) -> Result<Option<i64>> {
        Ok(self
            .tables
            .lock()
            .await
            .vouchers
            .get(&voucher_id)
            .map(|v| v.stock))
    }

    async fn count_orders(&self, voucher_id: u64) -> Result<u64> {
        Ok(self
            .tables
            .lock()
            .await
            .buyers
            .iter()
            .filter(|(v, _)| *v == voucher_id)
            .count() as u64)
    }

    async fn find_order(&self, order_id: u64) -> Result<Option<VoucherOrder>> {
        Ok(self.tables.lock().await.orders.get(&order_id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn OrderTx>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        Ok(Box::new(InMemoryOrderTx {
            guard,
            undo_log: Vec::new(),
            fail_inserts: Arc::clone(&self.fail_inserts),
        }))
    }
}

struct InMemoryOrderTx {
    guard: OwnedMutexGuard<OrderTables>,
    undo_log: Vec<Undo>,
    fail_inserts: Arc<AtomicBool>,
}

impl Drop for InMemoryOrderTx {
    fn drop(&mut self) {
        // Committed transactions leave an empty log
        while let Some(write) = self.undo_log.pop() {
            self.guard.undo(write);
        }
    }
}

#[async_trait]
impl OrderTx for InMemoryOrderTx {
    async fn order_exists(&mut self, voucher_id: u64, user_id: u64) -> Result<bool> {
        Ok(self.guard.has_order(voucher_id, user_id))
    }

    async fn decrement_stock(&mut self, voucher_id: u64) -> Result<bool> {
        match self.guard.vouchers.get_mut(&voucher_id) {
            Some(voucher) if voucher.stock > 0 => {
                voucher.stock -= 1;
                self.undo_log.push(Undo::StockDecremented(voucher_id));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::Repository("insert into voucher_order failed".into()));
        }
        if self.guard.orders.contains_key(&order.id) {
            return Err(Error::Repository(format!(
                "duplicate primary key {} in voucher_order",
                order.id
            )));
        }
        if !self.guard.buyers.insert((order.voucher_id, order.user_id)) {
            return Err(Error::Repository(format!(
                "duplicate (voucher_id, user_id) ({}, {}) in voucher_order",
                order.voucher_id, order.user_id
            )));
        }
        self.guard.orders.insert(order.id, order.clone());
        self.undo_log.push(Undo::OrderInserted(order.id));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.undo_log.clear();
        Ok(())
    }
}

/// Shop and shop-type tables.
#[derive(Debug, Default)]
pub struct InMemoryShopRepository {
    shops: DashMap<u64, Shop>,
    types: RwLock<Vec<ShopType>>,
    reads: AtomicU64,
}

impl InMemoryShopRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_shop(&self, shop: Shop) {
        self.shops.insert(shop.id, shop);
    }

    pub fn insert_shop_type(&self, shop_type: ShopType) {
        self.types.write().push(shop_type);
    }

    /// Number of row reads served, across shops and types.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ShopRepository for InMemoryShopRepository {
    async fn get_shop(&self, id: u64) -> Result<Option<Shop>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.shops.get(&id).map(|s| s.value().clone()))
    }

    async fn update_shop(&self, shop: &Shop) -> Result<bool> {
        match self.shops.get_mut(&shop.id) {
            Some(mut row) => {
                *row = shop.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_shop_types(&self) -> Result<Vec<ShopType>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut types = self.types.read().clone();
        types.sort_by_key(|t| t.sort);
        Ok(types)
    }
}
