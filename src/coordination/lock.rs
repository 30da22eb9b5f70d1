//! Distributed Lock
//!
//! Mutual exclusion over the key-value store's conditional set. A lock is a
//! key holding a random holder token with an expiry, so a crashed holder can
//! only block others for `ttl`.
//!
//! Release goes through compare-and-delete: a holder whose lock already
//! expired and was taken over by someone else cannot delete the new
//! holder's key.
//!
//! Acquisition never blocks or retries and is not re-entrant; a holder that
//! calls [`DistributedLock::try_acquire`] on its own key gets `None`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ports::KeyValueStore;
use crate::error::Result;

/// Proof of a held lock. Pass it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    holder_token: String,
    ttl: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_token(&self) -> &str {
        &self.holder_token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Lock factory bound to one store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock").finish_non_exhaustive()
    }
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Try once to take `key` for at most `ttl`.
    ///
    /// `Ok(None)` means someone else holds it; store failures are errors.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let holder_token = Uuid::new_v4().to_string();
        if self.store.set_if_absent(key, &holder_token, ttl).await? {
            debug!(lock = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
            Ok(Some(LockHandle {
                key: key.to_string(),
                holder_token,
                ttl,
            }))
        } else {
            debug!(lock = %key, "Lock busy");
            Ok(None)
        }
    }

    /// Release a lock. Returns false if it had already expired or now
    /// belongs to another holder; in that case nothing is deleted.
    pub async fn release(&self, handle: LockHandle) -> Result<bool> {
        let released = self
            .store
            .compare_and_delete(&handle.key, &handle.holder_token)
            .await?;
        if !released {
            warn!(
                lock = %handle.key,
                ttl_ms = handle.ttl.as_millis() as u64,
                "Lock was no longer ours at release; it expired while held"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use assert_matches::assert_matches;

    fn lock() -> (Arc<InMemoryStore>, DistributedLock) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), DistributedLock::new(store))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (store, lock) = lock();

        let handle = lock
            .try_acquire("lock:order:1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("free lock");
        assert_eq!(handle.key(), "lock:order:1");
        assert_eq!(
            store.get("lock:order:1").await.unwrap().as_deref(),
            Some(handle.holder_token())
        );

        assert!(lock.release(handle).await.unwrap());
        assert!(store.get("lock:order:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_not_reentrant() {
        let (_, lock) = lock();
        let ttl = Duration::from_secs(30);

        let _held = lock.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();
        assert!(lock.try_acquire("lock:shop:1", ttl).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_frees_lock() {
        let (_, lock) = lock();
        let ttl = Duration::from_secs(10);

        let _crashed_holder = lock.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(lock.try_acquire("lock:shop:1", ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_keeps_new_holder() {
        let (store, lock) = lock();
        let ttl = Duration::from_secs(10);

        let stale = lock.try_acquire("lock:order:7", ttl).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let current = lock.try_acquire("lock:order:7", ttl).await.unwrap().unwrap();

        assert!(!lock.release(stale).await.unwrap());
        assert_eq!(
            store.get("lock:order:7").await.unwrap().as_deref(),
            Some(current.holder_token())
        );
        assert!(lock.release(current).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error() {
        let (store, lock) = lock();
        store.set_available(false);
        assert_matches!(
            lock.try_acquire("lock:shop:1", Duration::from_secs(1)).await,
            Err(crate::error::Error::Store(_))
        );
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let (_, lock) = lock();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let lock = lock.clone();
            tasks.spawn(async move {
                lock.try_acquire("lock:shop:9", Duration::from_secs(30))
                    .await
                    .unwrap()
                    .is_some()
            });
        }

        let mut winners = 0;
        while let Some(won) = tasks.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
