//! Time-Ordered ID Generator
//!
//! 64-bit identifiers laid out as
//!
//! ```text
//! ┌───────────────────────────────┬───────────────────────────────┐
//! │ seconds since 2022-01-01 (32) │ per-day counter (32)          │
//! └───────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! The counter lives in the store under `icr:{businessKey}:{yyyy:MM:dd}` and
//! is bumped with INCR, so every process sharing the store draws from the same
//! sequence. A new day starts a new counter key; the timestamp half keeps IDs
//! from different days apart even though each counter restarts at 1.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};
use crate::keys;

/// Epoch anchor: 2022-01-01T00:00:00Z
pub const BEGIN_TIMESTAMP: i64 = 1_640_995_200;

/// Width of the counter half
pub const COUNT_BITS: u32 = 32;

/// Join the two halves of an ID.
pub fn compose_id(seconds_since_anchor: u64, counter: u32) -> u64 {
    (seconds_since_anchor << COUNT_BITS) | counter as u64
}

/// Split an ID into (seconds since anchor, daily counter).
pub fn decompose_id(id: u64) -> (u64, u32) {
    (id >> COUNT_BITS, (id & u32::MAX as u64) as u32)
}

/// Store-backed ID generator.
#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

impl IdGenerator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Next ID for `business_key` at the current time.
    pub async fn next_id(&self, business_key: &str) -> Result<u64> {
        self.next_id_at(business_key, Utc::now()).await
    }

    /// Next ID for `business_key` as if the clock read `now`.
    pub async fn next_id_at(&self, business_key: &str, now: DateTime<Utc>) -> Result<u64> {
        if business_key.is_empty() {
            return Err(Error::Validation("business key must not be empty".into()));
        }

        let seconds = now.timestamp() - BEGIN_TIMESTAMP;
        if seconds < 0 {
            return Err(Error::Internal(format!(
                "clock reads {} which is before the ID epoch",
                now
            )));
        }

        let date = now.format("%Y:%m:%d").to_string();
        let counter_key = keys::id_counter_key(business_key, &date);
        let count = self.store.incr(&counter_key).await?;
        let count = u32::try_from(count).map_err(|_| {
            Error::Internal(format!("daily counter {} out of range: {}", counter_key, count))
        })?;

        let id = compose_id(seconds as u64, count);
        trace!(business_key, id, count, "Generated id");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn generator() -> (Arc<InMemoryStore>, IdGenerator) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), IdGenerator::new(store))
    }

    #[tokio::test]
    async fn test_sequential_ids_strictly_increase() {
        let (_, ids) = generator();
        let mut last = 0;
        for _ in 0..500 {
            let id = ids.next_id("order").await.unwrap();
            assert!(id > last, "{} not greater than {}", id, last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_counter_key_is_scoped_per_day() {
        let (store, ids) = generator();
        let day = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        ids.next_id_at("order", day).await.unwrap();
        ids.next_id_at("order", day).await.unwrap();

        assert_eq!(
            store.get("icr:order:2024:03:09").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_days_do_not_collide_after_counter_reset() {
        let (_, ids) = generator();
        let monday = Utc.with_ymd_and_hms(2024, 3, 11, 23, 59, 59).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2024, 3, 12, 0, 0, 0).unwrap();

        let a = ids.next_id_at("order", monday).await.unwrap();
        let b = ids.next_id_at("order", tuesday).await.unwrap();

        assert_eq!(decompose_id(a).1, 1);
        assert_eq!(decompose_id(b).1, 1);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_business_keys_are_independent() {
        let (_, ids) = generator();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let order = ids.next_id_at("order", now).await.unwrap();
        let refund = ids.next_id_at("refund", now).await.unwrap();
        assert_eq!(decompose_id(order).1, 1);
        assert_eq!(decompose_id(refund).1, 1);
    }

    #[tokio::test]
    async fn test_timestamp_half() {
        let (_, ids) = generator();
        let now = Utc.with_ymd_and_hms(2022, 1, 1, 0, 1, 40).unwrap();
        let id = ids.next_id_at("order", now).await.unwrap();
        assert_eq!(decompose_id(id), (100, 1));
    }

    #[tokio::test]
    async fn test_rejects_bad_input_and_store_outage() {
        let (store, ids) = generator();
        assert_matches!(ids.next_id("").await, Err(Error::Validation(_)));

        let before_epoch = Utc.with_ymd_and_hms(2021, 12, 31, 0, 0, 0).unwrap();
        assert_matches!(
            ids.next_id_at("order", before_epoch).await,
            Err(Error::Internal(_))
        );

        store.set_available(false);
        assert_matches!(ids.next_id("order").await, Err(Error::Store(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_later_second_always_sorts_after(
            ts in 0u64..(u32::MAX as u64),
            gap in 1u64..86_400,
            c1 in 1u32..=u32::MAX,
            c2 in 1u32..=u32::MAX,
        ) {
            prop_assert!(compose_id(ts, c1) < compose_id(ts + gap, c2));
        }

        #[test]
        fn prop_same_instant_ids_increase(
            secs in 0i64..(10 * 365 * 86_400),
            n in 2usize..40,
        ) {
            let now = Utc.timestamp_opt(BEGIN_TIMESTAMP + secs, 0).unwrap();
            let (_, ids) = generator();
            let drawn: Vec<u64> = tokio_test::block_on(async {
                let mut out = Vec::with_capacity(n);
                for _ in 0..n {
                    out.push(ids.next_id_at("order", now).await.unwrap());
                }
                out
            });
            prop_assert!(drawn.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(decompose_id(drawn[0]), (secs as u64, 1));
        }
    }
}
