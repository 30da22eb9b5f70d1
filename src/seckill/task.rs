//! Seckill Request and Outcome Types

use serde::{Deserialize, Serialize, Serializer};

/// An admitted purchase waiting to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeckillTask {
    pub order_id: u64,
    pub user_id: u64,
    pub voucher_id: u64,
}

/// Why a purchase was turned away at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    OutOfStock,
    DuplicatePurchase,
    NotStarted,
    Ended,
}

impl RejectReason {
    /// Message suitable for showing to the buyer
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::OutOfStock => "Sold out",
            RejectReason::DuplicatePurchase => "Each user may buy this voucher only once",
            RejectReason::NotStarted => "The sale has not started yet",
            RejectReason::Ended => "The sale has ended",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Synchronous answer to a purchase request.
///
/// Serializes as `{"accepted": bool, "orderId"?: u64, "reason"?: ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Accepted { order_id: u64 },
    Rejected { reason: RejectReason },
}

impl AdmissionResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AdmissionResult::Accepted { .. })
    }

    pub fn order_id(&self) -> Option<u64> {
        match self {
            AdmissionResult::Accepted { order_id } => Some(*order_id),
            AdmissionResult::Rejected { .. } => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            AdmissionResult::Accepted { .. } => None,
            AdmissionResult::Rejected { reason } => Some(*reason),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionWire {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
}

impl Serialize for AdmissionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        AdmissionWire {
            accepted: self.is_accepted(),
            order_id: self.order_id(),
            reason: self.reject_reason(),
        }
        .serialize(serializer)
    }
}

/// What the consumer did with one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Order row written and durable stock decremented
    Persisted,
    /// Another worker holds this user's order lock
    LockBusy,
    /// An order for this (voucher, user) already exists
    AlreadyOrdered,
    /// The durable stock guard rejected the decrement
    StockExhausted,
}

impl PersistOutcome {
    pub fn is_fault(&self) -> bool {
        !matches!(self, PersistOutcome::Persisted)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            PersistOutcome::Persisted => "persisted",
            PersistOutcome::LockBusy => "order lock held by another worker",
            PersistOutcome::AlreadyOrdered => "order already exists for this user and voucher",
            PersistOutcome::StockExhausted => "durable stock exhausted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_wire_format() {
        let accepted = serde_json::to_value(AdmissionResult::Accepted { order_id: 77 }).unwrap();
        assert_eq!(accepted, serde_json::json!({"accepted": true, "orderId": 77}));

        let rejected = serde_json::to_value(AdmissionResult::Rejected {
            reason: RejectReason::DuplicatePurchase,
        })
        .unwrap();
        assert_eq!(
            rejected,
            serde_json::json!({"accepted": false, "reason": "duplicatePurchase"})
        );
    }

    #[test]
    fn test_persist_outcome_faults() {
        assert!(!PersistOutcome::Persisted.is_fault());
        assert!(PersistOutcome::LockBusy.is_fault());
        assert!(PersistOutcome::StockExhausted.is_fault());
    }
}
