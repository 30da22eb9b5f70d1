//! Domain Events
//!
//! Immutable records of things that happened in the cache and order pipeline.
//! Persistence faults are only visible to the original caller through these
//! events and the order status board, since the caller was answered before
//! the order was written.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::order_persisted(order_id, user_id, voucher_id);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Order Events
    // =========================================================================
    /// A purchase passed the admission check and was queued.
    OrderAdmitted {
        order_id: u64,
        user_id: u64,
        voucher_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// The order row was written.
    OrderPersisted {
        order_id: u64,
        user_id: u64,
        voucher_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// The order was admitted but could not be written.
    OrderPersistFailed {
        order_id: u64,
        user_id: u64,
        voucher_id: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Cache Events
    // =========================================================================
    /// A logically expired entry was reloaded.
    CacheRebuilt {
        key: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A background reload failed; the stale entry stays in place.
    CacheRebuildFailed {
        key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::OrderAdmitted { timestamp, .. } => *timestamp,
            DomainEvent::OrderPersisted { timestamp, .. } => *timestamp,
            DomainEvent::OrderPersistFailed { timestamp, .. } => *timestamp,
            DomainEvent::CacheRebuilt { timestamp, .. } => *timestamp,
            DomainEvent::CacheRebuildFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderAdmitted { .. } => "OrderAdmitted",
            DomainEvent::OrderPersisted { .. } => "OrderPersisted",
            DomainEvent::OrderPersistFailed { .. } => "OrderPersistFailed",
            DomainEvent::CacheRebuilt { .. } => "CacheRebuilt",
            DomainEvent::CacheRebuildFailed { .. } => "CacheRebuildFailed",
        }
    }

    /// Get the order ID if applicable.
    pub fn order_id(&self) -> Option<u64> {
        match self {
            DomainEvent::OrderAdmitted { order_id, .. } => Some(*order_id),
            DomainEvent::OrderPersisted { order_id, .. } => Some(*order_id),
            DomainEvent::OrderPersistFailed { order_id, .. } => Some(*order_id),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    pub fn order_admitted(order_id: u64, user_id: u64, voucher_id: u64) -> Self {
        DomainEvent::OrderAdmitted {
            order_id,
            user_id,
            voucher_id,
            timestamp: Utc::now(),
        }
    }

    pub fn order_persisted(order_id: u64, user_id: u64, voucher_id: u64) -> Self {
        DomainEvent::OrderPersisted {
            order_id,
            user_id,
            voucher_id,
            timestamp: Utc::now(),
        }
    }

    pub fn order_persist_failed(
        order_id: u64,
        user_id: u64,
        voucher_id: u64,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::OrderPersistFailed {
            order_id,
            user_id,
            voucher_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn cache_rebuilt(key: impl Into<String>, duration: std::time::Duration) -> Self {
        DomainEvent::CacheRebuilt {
            key: key.into(),
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn cache_rebuild_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainEvent::CacheRebuildFailed {
            key: key.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}
