//! Prometheus Exposition
//!
//! The cache and pipeline keep their own atomic counters; this module mirrors
//! their snapshots into a Prometheus registry at scrape time.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::cache::CacheMetricsSnapshot;
use crate::error::{Error, Result};
use crate::seckill::PipelineMetricsSnapshot;

/// Registered collectors for the service.
pub struct ServiceMetrics {
    registry: Registry,

    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_null_hits: IntCounter,
    cache_stale_reads: IntCounter,
    cache_loads: IntCounter,
    cache_rebuilds: IntCounter,
    cache_rebuild_failures: IntCounter,

    orders_submitted: IntCounter,
    orders_accepted: IntCounter,
    orders_rejected: IntCounter,
    orders_reverted: IntCounter,
    orders_persisted: IntCounter,
    orders_persist_faults: IntCounter,
    order_queue_depth: IntGauge,
    order_status_tracked: IntGauge,
}

impl std::fmt::Debug for ServiceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMetrics").finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help).map_err(metrics_error)?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(metrics_error)?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(name, help).map_err(metrics_error)?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(metrics_error)?;
    Ok(gauge)
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registry: {}", e))
}

/// Advance a monotonic counter to `value`.
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl ServiceMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("flashsale".into()), None).map_err(metrics_error)?;

        let order_queue_depth = gauge(
            &registry,
            "order_queue_depth",
            "Admitted orders waiting for the consumer",
        )?;
        let order_status_tracked = gauge(
            &registry,
            "order_status_tracked",
            "Orders whose outcome can still be polled",
        )?;

        Ok(Self {
            cache_hits: counter(&registry, "cache_hits_total", "Reads answered from the cache")?,
            cache_misses: counter(&registry, "cache_misses_total", "Reads that missed the cache")?,
            cache_null_hits: counter(
                &registry,
                "cache_null_hits_total",
                "Reads answered by a null sentinel",
            )?,
            cache_stale_reads: counter(
                &registry,
                "cache_stale_reads_total",
                "Logically expired entries served",
            )?,
            cache_loads: counter(
                &registry,
                "cache_backing_loads_total",
                "Loader calls against the backing store",
            )?,
            cache_rebuilds: counter(
                &registry,
                "cache_rebuilds_total",
                "Background rebuilds that refreshed an entry",
            )?,
            cache_rebuild_failures: counter(
                &registry,
                "cache_rebuild_failures_total",
                "Background rebuilds that failed",
            )?,
            orders_submitted: counter(
                &registry,
                "orders_submitted_total",
                "Purchase requests received",
            )?,
            orders_accepted: counter(
                &registry,
                "orders_accepted_total",
                "Purchase requests admitted",
            )?,
            orders_rejected: counter(
                &registry,
                "orders_rejected_total",
                "Purchase requests rejected at admission",
            )?,
            orders_reverted: counter(
                &registry,
                "orders_reverted_total",
                "Admissions undone because they could not be queued",
            )?,
            orders_persisted: counter(&registry, "orders_persisted_total", "Order rows written")?,
            orders_persist_faults: counter(
                &registry,
                "orders_persist_faults_total",
                "Admitted orders that were never written",
            )?,
            order_queue_depth,
            order_status_tracked,
            registry,
        })
    }

    /// Copy the latest snapshots into the registry.
    pub fn observe(
        &self,
        cache: &CacheMetricsSnapshot,
        pipeline: &PipelineMetricsSnapshot,
        queue_depth: usize,
    ) {
        advance(&self.cache_hits, cache.hits);
        advance(&self.cache_misses, cache.misses);
        advance(&self.cache_null_hits, cache.null_hits);
        advance(&self.cache_stale_reads, cache.stale_reads);
        advance(&self.cache_loads, cache.loads);
        advance(&self.cache_rebuilds, cache.rebuilds_succeeded);
        advance(&self.cache_rebuild_failures, cache.rebuilds_failed);

        advance(&self.orders_submitted, pipeline.submitted);
        advance(&self.orders_accepted, pipeline.accepted);
        advance(
            &self.orders_rejected,
            pipeline.rejected_out_of_stock + pipeline.rejected_duplicate + pipeline.rejected_window,
        );
        advance(&self.orders_reverted, pipeline.reverted);
        advance(&self.orders_persisted, pipeline.persisted);
        advance(&self.orders_persist_faults, pipeline.persist_faults());
        self.order_queue_depth.set(queue_depth as i64);
        self.order_status_tracked.set(pipeline.tracked_orders as i64);
    }

    /// Text exposition format
    pub fn render(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_reflects_snapshots() {
        let metrics = ServiceMetrics::new().unwrap();
        let cache = CacheMetricsSnapshot {
            hits: 7,
            loads: 2,
            ..Default::default()
        };
        let pipeline = PipelineMetricsSnapshot {
            submitted: 10,
            accepted: 1,
            rejected_out_of_stock: 9,
            persisted: 1,
            tracked_orders: 1,
            ..Default::default()
        };

        metrics.observe(&cache, &pipeline, 3);
        let text = String::from_utf8(metrics.render().unwrap()).unwrap();

        assert!(text.contains("flashsale_cache_hits_total 7"));
        assert!(text.contains("flashsale_orders_rejected_total 9"));
        assert!(text.contains("flashsale_order_queue_depth 3"));
        assert!(text.contains("flashsale_order_status_tracked 1"));
    }

    #[test]
    fn test_counters_never_go_backwards() {
        let metrics = ServiceMetrics::new().unwrap();
        let mut pipeline = PipelineMetricsSnapshot {
            persisted: 5,
            ..Default::default()
        };
        metrics.observe(&CacheMetricsSnapshot::default(), &pipeline, 0);
        pipeline.persisted = 3;
        metrics.observe(&CacheMetricsSnapshot::default(), &pipeline, 0);

        assert_eq!(metrics.orders_persisted.get(), 5);
    }
}
