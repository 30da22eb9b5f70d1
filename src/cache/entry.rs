//! Cached Payload Shapes

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Value stored in place of a payload when the backing store confirmed the
/// entity does not exist.
pub const NULL_SENTINEL: &str = "";

/// What a raw cache read turned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    /// Key not in the cache
    Missing,
    /// Null sentinel: known to be absent from the backing store
    ConfirmedAbsent,
    /// Serialized payload
    Present(String),
}

impl From<Option<String>> for CachedValue {
    fn from(raw: Option<String>) -> Self {
        match raw {
            None => CachedValue::Missing,
            Some(raw) if raw == NULL_SENTINEL => CachedValue::ConfirmedAbsent,
            Some(raw) => CachedValue::Present(raw),
        }
    }
}

/// Payload wrapper for entries that expire logically rather than through a
/// store TTL.
///
/// Serialized as `{"data": ..., "expireTime": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEntry<T> {
    pub data: T,
    pub expire_time: DateTime<Utc>,
}

impl<T> LogicalEntry<T> {
    /// Wrap `data` so that it goes stale `ttl` from now.
    pub fn expiring_in(data: T, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Validation(format!("logical ttl out of range: {}", e)))?;
        Ok(Self {
            data,
            expire_time: Utc::now() + ttl,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_time
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_raw_values() {
        assert_eq!(CachedValue::from(None), CachedValue::Missing);
        assert_eq!(
            CachedValue::from(Some(String::new())),
            CachedValue::ConfirmedAbsent
        );
        assert_eq!(
            CachedValue::from(Some("{}".to_string())),
            CachedValue::Present("{}".to_string())
        );
    }

    #[test]
    fn test_logical_entry_wire_format() {
        let entry = LogicalEntry::expiring_in(7u32, Duration::from_secs(60)).unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["data"], 7);
        assert!(json["expireTime"].is_string());
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_zero_ttl_is_immediately_stale() {
        let entry = LogicalEntry::expiring_in("x", Duration::ZERO).unwrap();
        assert!(entry.is_expired());
    }
}
