//! Cache Metrics Collection
//!
//! Counters for monitoring how often the backing store is reached and how
//! rebuilds behave.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Reads
    hits: AtomicU64,
    misses: AtomicU64,
    null_hits: AtomicU64,
    stale_reads: AtomicU64,

    // Backing store
    loads: AtomicU64,
    null_writes: AtomicU64,
    load_latency_us: AtomicU64,

    // Rebuilds
    rebuilds_scheduled: AtomicU64,
    rebuilds_succeeded: AtomicU64,
    rebuilds_failed: AtomicU64,
    rebuilds_skipped: AtomicU64,
    rebuild_lock_busy: AtomicU64,

    // Mutex strategy
    mutex_retries: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_null_hit(&self) {
        self.null_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_read(&self) {
        self.stale_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self, duration: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.load_latency_us, duration);
    }

    pub fn record_null_write(&self) {
        self.null_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_scheduled(&self) {
        self.rebuilds_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_succeeded(&self) {
        self.rebuilds_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_failed(&self) {
        self.rebuilds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_skipped(&self) {
        self.rebuilds_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_lock_busy(&self) {
        self.rebuild_lock_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mutex_retry(&self) {
        self.mutex_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Fraction of reads answered without the backing store, counting
    /// null-sentinel and stale reads as hits.
    pub fn hit_ratio(&self) -> f64 {
        let answered = self.hits()
            + self.null_hits.load(Ordering::Relaxed)
            + self.stale_reads.load(Ordering::Relaxed);
        let total = answered + self.misses();
        if total == 0 {
            0.0
        } else {
            answered as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            null_hits: self.null_hits.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            loads: self.loads(),
            null_writes: self.null_writes.load(Ordering::Relaxed),
            load_latency: Duration::from_micros(self.load_latency_us.load(Ordering::Relaxed)),
            rebuilds_scheduled: self.rebuilds_scheduled.load(Ordering::Relaxed),
            rebuilds_succeeded: self.rebuilds_succeeded.load(Ordering::Relaxed),
            rebuilds_failed: self.rebuilds_failed.load(Ordering::Relaxed),
            rebuilds_skipped: self.rebuilds_skipped.load(Ordering::Relaxed),
            rebuild_lock_busy: self.rebuild_lock_busy.load(Ordering::Relaxed),
            mutex_retries: self.mutex_retries.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub null_hits: u64,
    pub stale_reads: u64,
    pub loads: u64,
    pub null_writes: u64,
    pub load_latency: Duration,
    pub rebuilds_scheduled: u64,
    pub rebuilds_succeeded: u64,
    pub rebuilds_failed: u64,
    pub rebuilds_skipped: u64,
    pub rebuild_lock_busy: u64,
    pub mutex_retries: u64,
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio_counts_sentinels() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_miss();
        metrics.record_null_hit();
        metrics.record_null_hit();
        metrics.record_hit();
        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_latency_ema() {
        let metrics = CacheMetrics::new();
        metrics.record_load(Duration::from_micros(1000));
        metrics.record_load(Duration::from_micros(2000));

        let snap = metrics.snapshot();
        assert_eq!(snap.loads, 2);
        let us = snap.load_latency.as_micros();
        assert!((1090..=1110).contains(&us), "ema was {}us", us);
    }
}
