//! Cache-Aside Client
//!
//! Read-through caching in front of a slower backing store, with three read
//! strategies chosen per call site:
//!
//! - [`CacheClient::get`] - TTL entries plus a null sentinel for entities the
//!   backing store does not have, so repeated lookups of unknown ids stop at
//!   the cache.
//! - [`CacheClient::get_with_logical_expiry`] - entries without a store TTL;
//!   staleness is a timestamp inside the payload. Stale values are returned
//!   at once while a single background task, guarded by the entity's rebuild
//!   lock, reloads them.
//! - [`CacheClient::get_with_mutex`] - misses are filled by whoever takes the
//!   rebuild lock; everyone else waits briefly and re-reads.
//!
//! Background rebuilds run on a bounded pool (a semaphore of
//! `rebuild_workers` permits) and are tracked so [`CacheClient::shutdown`]
//! can wait for them.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::entry::{CachedValue, LogicalEntry, NULL_SENTINEL};
use super::metrics::{CacheMetrics, CacheMetricsSnapshot};
use super::KeySpace;
use crate::adapters::LoggingEventPublisher;
use crate::coordination::{DistributedLock, LockHandle};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, KeyValueStore};
use crate::error::{Error, Result};
use crate::keys;

/// Cache client configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of the null sentinel
    pub null_ttl: Duration,
    /// Lifetime of a rebuild lock
    pub lock_ttl: Duration,
    /// Background rebuilds allowed to run at once
    pub rebuild_workers: usize,
    /// Pause between attempts in [`CacheClient::get_with_mutex`]
    pub mutex_retry_delay: Duration,
    /// Attempts before [`CacheClient::get_with_mutex`] gives up
    pub mutex_max_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            null_ttl: keys::CACHE_NULL_TTL,
            lock_ttl: keys::LOCK_SHOP_TTL,
            rebuild_workers: 10,
            mutex_retry_delay: Duration::from_millis(50),
            mutex_max_retries: 100,
        }
    }
}

/// Cache-aside client over a [`KeyValueStore`].
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn KeyValueStore>,
    lock: DistributedLock,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
    events: Arc<dyn EventPublisher>,
    rebuild_slots: Arc<Semaphore>,
    rebuilds: TaskTracker,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.config)
            .field("rebuilds_in_flight", &self.rebuilds.len())
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    /// Create a client with default configuration
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    /// Create a client with custom configuration
    pub fn with_config(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        let workers = config.rebuild_workers.max(1);
        Self {
            lock: DistributedLock::new(Arc::clone(&store)),
            store,
            config,
            metrics: Arc::new(CacheMetrics::new()),
            events: Arc::new(LoggingEventPublisher::new()),
            rebuild_slots: Arc::new(Semaphore::new(workers)),
            rebuilds: TaskTracker::new(),
        }
    }

    /// Send rebuild events somewhere other than the log.
    pub fn with_event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    // =========================================================================
    // Pass-through with null caching
    // =========================================================================

    /// Read `{prefix}{id}`, falling back to `loader` on a miss.
    ///
    /// A loader result is cached for `ttl`; a loader `None` is cached as the
    /// null sentinel for `null_ttl`, and later reads of that key return
    /// `None` without calling any loader.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn get<R, ID, F, Fut>(
        &self,
        space: &KeySpace,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = Result<Option<R>>>,
    {
        let key = space.data_key(&id);
        match CachedValue::from(self.store.get(&key).await?) {
            CachedValue::Present(raw) => {
                self.metrics.record_hit();
                return Ok(Some(serde_json::from_str(&raw)?));
            }
            CachedValue::ConfirmedAbsent => {
                self.metrics.record_null_hit();
                debug!(key = %key, "Null sentinel hit");
                return Ok(None);
            }
            CachedValue::Missing => self.metrics.record_miss(),
        }

        self.load_through(&key, id, loader, ttl).await
    }

    async fn load_through<R, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: Serialize,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = Result<Option<R>>>,
    {
        let started = Instant::now();
        let loaded = loader(id).await?;
        self.metrics.record_load(started.elapsed());

        match loaded {
            Some(value) => {
                let payload = serde_json::to_string(&value)?;
                self.store.set(key, &payload, Some(ttl)).await?;
                Ok(Some(value))
            }
            None => {
                self.store
                    .set(key, NULL_SENTINEL, Some(self.config.null_ttl))
                    .await?;
                self.metrics.record_null_write();
                debug!(key = %key, "Cached null sentinel");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Logical expiry with background rebuild
    // =========================================================================

    /// Read a logically expiring entry.
    ///
    /// A missing key is `None` (these entries are expected to be warmed). A
    /// stale entry is returned as-is; if this caller wins the rebuild lock a
    /// background task reloads it through `loader` with a fresh `logical_ttl`.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn get_with_logical_expiry<R, ID, F, Fut>(
        &self,
        space: &KeySpace,
        id: ID,
        loader: F,
        logical_ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
        ID: Display + Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
    {
        let key = space.data_key(&id);
        let raw = match CachedValue::from(self.store.get(&key).await?) {
            CachedValue::Present(raw) => raw,
            _ => {
                self.metrics.record_miss();
                return Ok(None);
            }
        };

        let entry: LogicalEntry<R> = serde_json::from_str(&raw)?;
        if !entry.is_expired() {
            self.metrics.record_hit();
            return Ok(Some(entry.data));
        }
        self.metrics.record_stale_read();

        if self.rebuilds.is_closed() {
            return Ok(Some(entry.data));
        }

        let lock_key = space.lock_key(&id);
        match self.lock.try_acquire(&lock_key, self.config.lock_ttl).await {
            Ok(Some(handle)) => self.schedule_rebuild(key, handle, id, loader, logical_ttl),
            Ok(None) => {
                self.metrics.record_rebuild_lock_busy();
                debug!(key = %key, "Rebuild already in progress");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Could not take rebuild lock; serving stale entry");
            }
        }

        Ok(Some(entry.data))
    }

    fn schedule_rebuild<R, ID, F, Fut>(
        &self,
        key: String,
        handle: LockHandle,
        id: ID,
        loader: F,
        logical_ttl: Duration,
    ) where
        R: Serialize + Send + 'static,
        ID: Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let lock = self.lock.clone();
        let metrics = Arc::clone(&self.metrics);
        let events = Arc::clone(&self.events);
        let slots = Arc::clone(&self.rebuild_slots);
        self.metrics.record_rebuild_scheduled();

        self.rebuilds.spawn(async move {
            let started = Instant::now();
            let outcome = match slots.acquire_owned().await {
                Ok(_permit) => {
                    let refresh =
                        refresh_logical(store.as_ref(), &metrics, &key, id, loader, logical_ttl);
                    AssertUnwindSafe(refresh)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(Error::Internal("cache loader panicked".into())))
                }
                Err(_) => Err(Error::ShuttingDown),
            };

            if let Err(e) = lock.release(handle).await {
                warn!(key = %key, error = %e, "Failed to release rebuild lock");
            }

            let event = match outcome {
                Ok(true) => {
                    metrics.record_rebuild_succeeded();
                    info!(
                        key = %key,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Cache entry rebuilt"
                    );
                    Some(DomainEvent::cache_rebuilt(&key, started.elapsed()))
                }
                Ok(false) => {
                    metrics.record_rebuild_skipped();
                    debug!(key = %key, "Entry already fresh; rebuild skipped");
                    None
                }
                Err(e) => {
                    metrics.record_rebuild_failed();
                    warn!(key = %key, error = %e, "Cache rebuild failed; stale entry kept");
                    Some(DomainEvent::cache_rebuild_failed(&key, e.to_string()))
                }
            };

            if let Some(event) = event {
                if let Err(e) = events.publish(event).await {
                    warn!(key = %key, error = %e, "Failed to publish rebuild event");
                }
            }
        });
    }

    // =========================================================================
    // Mutex-guarded fill
    // =========================================================================

    /// Read with pass-through semantics, but let only the rebuild lock holder
    /// call `loader` on a miss. Others retry every `mutex_retry_delay` and
    /// give up with [`Error::LockContention`] after `mutex_max_retries`.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn get_with_mutex<R, ID, F, Fut>(
        &self,
        space: &KeySpace,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = Result<Option<R>>>,
    {
        let key = space.data_key(&id);
        let lock_key = space.lock_key(&id);
        let mut attempts = 0u32;

        loop {
            match CachedValue::from(self.store.get(&key).await?) {
                CachedValue::Present(raw) => {
                    self.metrics.record_hit();
                    return Ok(Some(serde_json::from_str(&raw)?));
                }
                CachedValue::ConfirmedAbsent => {
                    self.metrics.record_null_hit();
                    return Ok(None);
                }
                CachedValue::Missing => {}
            }

            if let Some(handle) = self.lock.try_acquire(&lock_key, self.config.lock_ttl).await? {
                self.metrics.record_miss();
                let filled = self.fill_under_lock(&key, id, loader, ttl).await;
                if let Err(e) = self.lock.release(handle).await {
                    warn!(key = %key, error = %e, "Failed to release rebuild lock");
                }
                return filled;
            }

            attempts += 1;
            if attempts > self.config.mutex_max_retries {
                return Err(Error::LockContention {
                    key: lock_key,
                    attempts,
                });
            }
            self.metrics.record_mutex_retry();
            tokio::time::sleep(self.config.mutex_retry_delay).await;
        }
    }

    async fn fill_under_lock<R, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = Result<Option<R>>>,
    {
        // The previous holder may have filled it between our read and our lock.
        match CachedValue::from(self.store.get(key).await?) {
            CachedValue::Present(raw) => return Ok(Some(serde_json::from_str(&raw)?)),
            CachedValue::ConfirmedAbsent => return Ok(None),
            CachedValue::Missing => {}
        }
        self.load_through(key, id, loader, ttl).await
    }

    // =========================================================================
    // Writers
    // =========================================================================

    /// Store `value` under `key` for `ttl`.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.store.set(key, &payload, Some(ttl)).await
    }

    /// Store `value` under `key` with no store TTL, stale after `logical_ttl`.
    pub async fn set_with_logical_expiry<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        logical_ttl: Duration,
    ) -> Result<()> {
        let entry = LogicalEntry::expiring_in(value, logical_ttl)?;
        let payload = serde_json::to_string(&entry)?;
        self.store.set(key, &payload, None).await
    }

    /// Drop a cached entry so the next read repopulates it.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let removed = self.store.delete(key).await?;
        debug!(key, removed, "Cache entry invalidated");
        Ok(removed)
    }

    /// Stop scheduling rebuilds and wait for the ones in flight.
    pub async fn shutdown(&self) {
        self.rebuilds.close();
        self.rebuilds.wait().await;
        info!("Cache rebuild pool drained");
    }
}

/// Reload one logically expiring entry. Returns false when the entry was
/// already fresh, i.e. an earlier rebuild finished after our stale read.
async fn refresh_logical<R, ID, F, Fut>(
    store: &dyn KeyValueStore,
    metrics: &CacheMetrics,
    key: &str,
    id: ID,
    loader: F,
    logical_ttl: Duration,
) -> Result<bool>
where
    R: Serialize,
    F: FnOnce(ID) -> Fut,
    Fut: Future<Output = Result<Option<R>>>,
{
    if let CachedValue::Present(raw) = CachedValue::from(store.get(key).await?) {
        let current: LogicalEntry<serde_json::Value> = serde_json::from_str(&raw)?;
        if !current.is_expired() {
            return Ok(false);
        }
    }

    let started = Instant::now();
    let loaded = loader(id).await?;
    metrics.record_load(started.elapsed());

    match loaded {
        Some(value) => {
            let entry = LogicalEntry::expiring_in(value, logical_ttl)?;
            store
                .set(key, &serde_json::to_string(&entry)?, None)
                .await?;
        }
        None => {
            // Entity is gone from the backing store
            store.delete(key).await?;
        }
    }
    Ok(true)
}
