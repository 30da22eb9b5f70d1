//! Cache-Aside Layer
//!
//! [`CacheClient`] reads through the key-value store in front of a slower
//! backing store. Entries for one kind of entity live under a [`KeySpace`]:
//! payloads at `{data_prefix}{id}`, rebuild locks at `{lock_prefix}{id}`.

pub mod client;
pub mod entry;
pub mod metrics;

use std::fmt::Display;

pub use client::{CacheClient, CacheConfig};
pub use entry::{CachedValue, LogicalEntry, NULL_SENTINEL};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};

use crate::keys;

/// Key prefixes for one cached entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpace {
    data_prefix: &'static str,
    lock_prefix: &'static str,
}

impl KeySpace {
    /// `cache:shop:{id}` guarded by `lock:shop:{id}`
    pub const SHOP: KeySpace = KeySpace::new(keys::CACHE_SHOP_KEY, keys::LOCK_SHOP_KEY);

    /// `cache:shop-hot:{id}` holding `{data, expireTime}` wrappers. Kept
    /// apart from [`KeySpace::SHOP`] since the payload shapes differ.
    pub const SHOP_HOT: KeySpace = KeySpace::new(keys::CACHE_SHOP_HOT_KEY, keys::LOCK_SHOP_KEY);

    pub const fn new(data_prefix: &'static str, lock_prefix: &'static str) -> Self {
        Self {
            data_prefix,
            lock_prefix,
        }
    }

    pub fn data_prefix(&self) -> &'static str {
        self.data_prefix
    }

    pub fn data_key<I: Display + ?Sized>(&self, id: &I) -> String {
        format!("{}{}", self.data_prefix, id)
    }

    pub fn lock_key<I: Display + ?Sized>(&self, id: &I) -> String {
        format!("{}{}", self.lock_prefix, id)
    }
}
