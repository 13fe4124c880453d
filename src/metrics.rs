//! Prometheus metrics for the portal data layer.
//!
//! Covers read-through cache behaviour, invalidations, backend health and
//! raw backend traffic.

use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use tracing::error;

pub struct Metrics {
    pub registry: Registry,

    // Cache metrics
    pub cache_hits_total: CounterVec,
    pub cache_misses_total: CounterVec,
    pub cache_coalesced_total: CounterVec,
    pub cache_fetch_errors_total: CounterVec,
    pub cache_skipped_total: CounterVec,
    pub cache_entries: Gauge,
    pub cache_in_flight: Gauge,
    pub cache_evicted_total: Counter,

    // Invalidation metrics
    pub invalidations_total: CounterVec,
    pub invalidated_entries_total: Counter,

    // Breaker metrics
    pub breaker_healthy: Gauge,
    pub breaker_trips_total: Counter,

    // Backend metrics
    pub backend_requests_total: CounterVec,
    pub backend_request_duration_seconds: HistogramVec,
    pub backend_retries_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits_total = CounterVec::new(
            Opts::new("medcache_cache_hits_total", "Reads served from the TTL store"),
            &["namespace"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = CounterVec::new(
            Opts::new(
                "medcache_cache_misses_total",
                "Reads that started a backend fetch",
            ),
            &["namespace"],
        )?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let cache_coalesced_total = CounterVec::new(
            Opts::new(
                "medcache_cache_coalesced_total",
                "Reads that joined an in-flight fetch",
            ),
            &["namespace"],
        )?;
        registry.register(Box::new(cache_coalesced_total.clone()))?;

        let cache_fetch_errors_total = CounterVec::new(
            Opts::new("medcache_cache_fetch_errors_total", "Failed fetches by kind"),
            &["namespace", "kind"],
        )?;
        registry.register(Box::new(cache_fetch_errors_total.clone()))?;

        let cache_skipped_total = CounterVec::new(
            Opts::new(
                "medcache_cache_skipped_total",
                "Fetches skipped because the backend is unhealthy",
            ),
            &["namespace"],
        )?;
        registry.register(Box::new(cache_skipped_total.clone()))?;

        let cache_entries = Gauge::with_opts(Opts::new(
            "medcache_cache_entries",
            "Entries currently held by the TTL store",
        ))?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_in_flight = Gauge::with_opts(Opts::new(
            "medcache_cache_in_flight",
            "Registered single-flight fetches",
        ))?;
        registry.register(Box::new(cache_in_flight.clone()))?;

        let cache_evicted_total = Counter::with_opts(Opts::new(
            "medcache_cache_evicted_total",
            "Expired entries removed by the sweeper",
        ))?;
        registry.register(Box::new(cache_evicted_total.clone()))?;

        let invalidations_total = CounterVec::new(
            Opts::new("medcache_invalidations_total", "Invalidation calls"),
            &["namespace"],
        )?;
        registry.register(Box::new(invalidations_total.clone()))?;

        let invalidated_entries_total = Counter::with_opts(Opts::new(
            "medcache_invalidated_entries_total",
            "Entries removed by invalidation",
        ))?;
        registry.register(Box::new(invalidated_entries_total.clone()))?;

        let breaker_healthy = Gauge::with_opts(Opts::new(
            "medcache_breaker_healthy",
            "Whether network calls are attempted (0 or 1)",
        ))?;
        registry.register(Box::new(breaker_healthy.clone()))?;

        let breaker_trips_total = Counter::with_opts(Opts::new(
            "medcache_breaker_trips_total",
            "Transitions into the unhealthy state",
        ))?;
        registry.register(Box::new(breaker_trips_total.clone()))?;

        let backend_requests_total = CounterVec::new(
            Opts::new("medcache_backend_requests_total", "Backend API requests"),
            &["method", "status"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "medcache_backend_request_duration_seconds",
                "Backend request duration",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method"],
        )?;
        registry.register(Box::new(backend_request_duration_seconds.clone()))?;

        let backend_retries_total = CounterVec::new(
            Opts::new("medcache_backend_retries_total", "Backend request retries"),
            &["method"],
        )?;
        registry.register(Box::new(backend_retries_total.clone()))?;

        Ok(Self {
            registry,
            cache_hits_total,
            cache_misses_total,
            cache_coalesced_total,
            cache_fetch_errors_total,
            cache_skipped_total,
            cache_entries,
            cache_in_flight,
            cache_evicted_total,
            invalidations_total,
            invalidated_entries_total,
            breaker_healthy,
            breaker_trips_total,
            backend_requests_total,
            backend_request_duration_seconds,
            backend_retries_total,
        })
    }

    pub fn record_hit(&self, namespace: &str) {
        self.cache_hits_total.with_label_values(&[namespace]).inc();
    }

    pub fn record_miss(&self, namespace: &str) {
        self.cache_misses_total.with_label_values(&[namespace]).inc();
    }

    pub fn record_coalesced(&self, namespace: &str) {
        self.cache_coalesced_total
            .with_label_values(&[namespace])
            .inc();
    }

    pub fn record_fetch_error(&self, namespace: &str, kind: &str) {
        self.cache_fetch_errors_total
            .with_label_values(&[namespace, kind])
            .inc();
    }

    pub fn record_skipped(&self, namespace: &str) {
        self.cache_skipped_total
            .with_label_values(&[namespace])
            .inc();
    }

    pub fn record_invalidation(&self, namespace: &str, removed: usize) {
        self.invalidations_total
            .with_label_values(&[namespace])
            .inc();
        self.invalidated_entries_total.inc_by(removed as f64);
    }

    /// Record a backend request
    pub fn record_backend_request(&self, method: &str, status: &str, duration_secs: f64) {
        self.backend_requests_total
            .with_label_values(&[method, status])
            .inc();
        self.backend_request_duration_seconds
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    pub fn record_backend_retry(&self, method: &str) {
        self.backend_retries_total
            .with_label_values(&[method])
            .inc();
    }

    /// Update store occupancy gauges
    pub fn update_cache_metrics(&self, stats: &crate::cache::CacheStats) {
        self.cache_entries.set(stats.entries as f64);
        self.cache_in_flight.set(stats.in_flight as f64);
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> SharedMetrics {
    Arc::new(Metrics::new().expect("Failed to create metrics"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.render().contains("medcache_cache_entries"));
    }

    #[test]
    fn test_cache_recording() {
        let metrics = Metrics::new().unwrap();
        metrics.record_hit("diseases");
        metrics.record_miss("diseases");
        metrics.record_invalidation("diseases", 3);

        let output = metrics.render();
        assert!(output.contains("medcache_cache_hits_total{namespace=\"diseases\"} 1"));
        assert!(output.contains("medcache_invalidated_entries_total 3"));
    }
}
