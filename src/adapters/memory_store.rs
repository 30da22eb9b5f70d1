//! In-Memory Key-Value Store
//!
//! Single-process stand-in for the networked store. All commands, including
//! the admission script, run under one mutex so they are atomic with respect
//! to each other, which is what the server-side scripts guarantee in
//! production. Expiry uses `tokio::time` so tests can pause the clock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::domain::ports::{AdmissionCode, KeyValueStore};
use crate::error::{Error, Result};
use crate::keys;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Debug)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, Slot>>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage. While unavailable every command fails with
    /// [`Error::Store`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining time to live of a key, `None` if missing or persistent.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let data = self.data.lock();
        data.get(key)
            .filter(|slot| slot.is_live(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Members of a set key (empty when missing).
    pub fn set_members(&self, key: &str) -> HashSet<String> {
        let now = Instant::now();
        let data = self.data.lock();
        match data.get(key).filter(|slot| slot.is_live(now)) {
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => members.clone(),
            _ => HashSet::new(),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Store("connection refused".to_string()))
        }
    }

    /// Drop the entry if it has expired, then hand back the live slot.
    fn live<'a>(data: &'a mut HashMap<String, Slot>, key: &str, now: Instant) -> Option<&'a mut Slot> {
        if data.get(key).is_some_and(|slot| !slot.is_live(now)) {
            data.remove(key);
        }
        data.get_mut(key)
    }

    fn read_integer(data: &mut HashMap<String, Slot>, key: &str, now: Instant) -> Result<i64> {
        match Self::live(data, key, now) {
            None => Ok(0),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => s
                .parse::<i64>()
                .map_err(|_| Error::Store(format!("value at {} is not an integer", key))),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Store(format!("WRONGTYPE operation against key {}", key))
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;

        let mut data = self.data.lock();
        match Self::live(&mut data, key, Instant::now()) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;

        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;

        let now = Instant::now();
        let mut data = self.data.lock();
        if Self::live(&mut data, key, now).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;

        let now = Instant::now();
        let mut data = self.data.lock();
        Ok(data.remove(key).is_some_and(|slot| slot.is_live(now)))
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        self.check_available()?;

        let mut data = self.data.lock();
        let matches = matches!(
            Self::live(&mut data, key, Instant::now()),
            Some(Slot { value: Value::Str(s), .. }) if s.as_str() == token
        );
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check_available()?;

        let now = Instant::now();
        let mut data = self.data.lock();
        let next = Self::read_integer(&mut data, key, now)? + 1;
        let expires_at = data.get(key).and_then(|slot| slot.expires_at);
        data.insert(
            key.to_string(),
            Slot {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn seckill_admit(&self, voucher_id: u64, user_id: u64) -> Result<AdmissionCode> {
        self.check_available()?;

        let stock_key = keys::seckill_stock_key(voucher_id);
        let order_key = keys::seckill_order_key(voucher_id);
        let user = user_id.to_string();
        let now = Instant::now();

        let mut data = self.data.lock();

        let stock = Self::read_integer(&mut data, &stock_key, now)?;
        if stock <= 0 {
            return Ok(AdmissionCode::OutOfStock);
        }

        let already_bought = match Self::live(&mut data, &order_key, now) {
            None => false,
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => members.contains(&user),
            Some(_) => return Err(wrong_type(&order_key)),
        };
        if already_bought {
            return Ok(AdmissionCode::Duplicate);
        }

        if let Some(slot) = data.get_mut(&stock_key) {
            slot.value = Value::Str((stock - 1).to_string());
        }
        let buyers = data.entry(order_key).or_insert_with(|| Slot {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        if let Value::Set(members) = &mut buyers.value {
            members.insert(user);
        }

        Ok(AdmissionCode::Accepted)
    }

    async fn seckill_revert(&self, voucher_id: u64, user_id: u64) -> Result<()> {
        self.check_available()?;

        let stock_key = keys::seckill_stock_key(voucher_id);
        let order_key = keys::seckill_order_key(voucher_id);
        let now = Instant::now();

        let mut data = self.data.lock();
        let removed = match Self::live(&mut data, &order_key, now) {
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => members.remove(&user_id.to_string()),
            _ => false,
        };
        if removed {
            let stock = Self::read_integer(&mut data, &stock_key, now)?;
            let expires_at = data.get(&stock_key).and_then(|slot| slot.expires_at);
            data.insert(
                stock_key,
                Slot {
                    value: Value::Str((stock + 1).to_string()),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(store.ttl_remaining("k").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_expiry() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("lock", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_if_absent("lock", "b", ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = InMemoryStore::new();
        store
            .set_if_absent("lock", "token-a", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("lock", "token-b").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_some());
        assert!(store.compare_and_delete("lock", "token-a").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_initializes_missing_key() {
        let store = InMemoryStore::new();
        assert_eq!(store.incr("icr:order:2024:01:01").await.unwrap(), 1);
        assert_eq!(store.incr("icr:order:2024:01:01").await.unwrap(), 2);

        store.set("text", "abc", None).await.unwrap();
        assert_matches!(store.incr("text").await, Err(Error::Store(_)));
    }

    #[tokio::test]
    async fn test_admission_script() {
        let store = InMemoryStore::new();
        store.set(&keys::seckill_stock_key(1), "1", None).await.unwrap();

        assert_eq!(store.seckill_admit(1, 7).await.unwrap(), AdmissionCode::Accepted);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.seckill_admit(1, 8).await.unwrap(), AdmissionCode::OutOfStock);

        store.set(&keys::seckill_stock_key(1), "5", None).await.unwrap();
        assert_eq!(store.seckill_admit(1, 7).await.unwrap(), AdmissionCode::Duplicate);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_admission_missing_stock_is_out_of_stock() {
        let store = InMemoryStore::new();
        assert_eq!(store.seckill_admit(99, 1).await.unwrap(), AdmissionCode::OutOfStock);
    }

    #[tokio::test]
    async fn test_revert_restores_stock_and_buyer() {
        let store = InMemoryStore::new();
        store.set(&keys::seckill_stock_key(1), "1", None).await.unwrap();
        store.seckill_admit(1, 7).await.unwrap();

        store.seckill_revert(1, 7).await.unwrap();
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("1"));
        assert!(store.set_members("seckill:order:1").is_empty());

        // Reverting twice must not mint stock.
        store.seckill_revert(1, 7).await.unwrap();
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_outage_surfaces_as_error() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert_matches!(store.get("k").await, Err(Error::Store(_)));
        assert_matches!(store.ping().await, Err(Error::Store(_)));

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
