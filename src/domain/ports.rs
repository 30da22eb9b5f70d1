//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions over the systems this crate talks to but does not own: the
//! networked key-value store, the relational order/shop tables, and the event
//! sink. Adapters in [`crate::adapters`] implement them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ KeyValueStore │ OrderRepository │ ShopRepository    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  RedisStore │ InMemoryStore │ InMemoryOrderRepo     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::DomainEvent;
use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Result of the atomic admission script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCode {
    /// Stock reserved and purchase intent recorded (script code 0)
    Accepted,
    /// No stock left (script code 1)
    OutOfStock,
    /// This user already holds a purchase intent (script code 2)
    Duplicate,
}

impl AdmissionCode {
    /// Decode the integer returned by the store-side script.
    pub fn from_script(code: i64) -> Result<Self> {
        match code {
            0 => Ok(AdmissionCode::Accepted),
            1 => Ok(AdmissionCode::OutOfStock),
            2 => Ok(AdmissionCode::Duplicate),
            other => Err(Error::UnexpectedScriptResult(other)),
        }
    }
}

/// A durable order row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherOrder {
    pub id: u64,
    pub user_id: u64,
    pub voucher_id: u64,
    pub created_at: DateTime<Utc>,
}

/// A flash-sale voucher with its stock and sale window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillVoucher {
    pub voucher_id: u64,
    pub stock: i64,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.begin_time && now <= self.end_time
    }
}

/// Shop row, cached as JSON under `cache:shop:{id}` (or wrapped with a
/// logical expiry under `cache:shop-hot:{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: u64,
    pub name: String,
    pub type_id: u64,
    pub area: String,
    pub address: String,
    pub avg_price: i64,
    pub score: u32,
}

/// Shop category, listed ordered by `sort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopType {
    pub id: u64,
    pub name: String,
    pub icon: String,
    pub sort: i32,
}

// =============================================================================
// Key-Value Store Port
// =============================================================================

/// Port for the networked key-value store.
///
/// Every method reports an unreachable store as an error. Implementations
/// must never turn a failure into `Ok(None)`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// GET
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// SET, with an optional expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// SET NX with expiry. Returns true if the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// DEL. Returns true if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete `key` only if its value equals `token`, atomically.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool>;

    /// INCR. A missing key counts as 0.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomic stock check, duplicate check, decrement and purchase record.
    async fn seckill_admit(&self, voucher_id: u64, user_id: u64) -> Result<AdmissionCode>;

    /// Undo a previous successful admission for this pair, atomically.
    async fn seckill_revert(&self, voucher_id: u64, user_id: u64) -> Result<()>;

    /// Round-trip used by readiness probes.
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// Relational Store Ports
// =============================================================================

/// Port for the voucher and order tables.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert or replace a seckill voucher row.
    async fn save_seckill_voucher(&self, voucher: &SeckillVoucher) -> Result<()>;

    /// Current durable stock for a voucher.
    async fn stock(&self, voucher_id: u64) -> Result<Option<i64>>;

    /// Number of persisted orders for a voucher.
    async fn count_orders(&self, voucher_id: u64) -> Result<u64>;

    /// Look up a persisted order.
    async fn find_order(&self, order_id: u64) -> Result<Option<VoucherOrder>>;

    /// Open a transaction. Dropping it without [`OrderTx::commit`] discards
    /// every write made through it.
    async fn begin(&self) -> Result<Box<dyn OrderTx>>;
}

/// A unit of work against the order tables.
#[async_trait]
pub trait OrderTx: Send {
    /// True if an order already exists for `(voucher_id, user_id)`.
    async fn order_exists(&mut self, voucher_id: u64, user_id: u64) -> Result<bool>;

    /// `UPDATE ... SET stock = stock - 1 WHERE voucher_id = ? AND stock > 0`.
    /// Returns false when the guard rejected the update.
    async fn decrement_stock(&mut self, voucher_id: u64) -> Result<bool>;

    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Port for the shop tables.
#[async_trait]
pub trait ShopRepository: Send + Sync {
    async fn get_shop(&self, id: u64) -> Result<Option<Shop>>;

    /// Returns false if no row with `shop.id` exists.
    async fn update_shop(&self, shop: &Shop) -> Result<bool>;

    /// All shop types ordered by `sort` ascending.
    async fn list_shop_types(&self) -> Result<Vec<ShopType>>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}
