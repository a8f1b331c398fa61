//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_counter_with_registry,
};
use std::sync::Arc;
use once_cell::sync::Lazy;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Provider client metrics
    pub provider_requests: CounterVec,
    pub provider_request_duration: HistogramVec,
    pub provider_cost_usd: CounterVec,
    pub circuit_open: CounterVec,

    // Cache metrics
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_degraded: Counter,

    // Rate limiting metrics
    pub rate_limit_allowed: CounterVec,
    pub rate_limit_denied: CounterVec,

    // Aggregation metrics
    pub aggregation_requests: CounterVec,
    pub aggregation_duration: HistogramVec,
    pub items_deduplicated: Counter,
    pub provider_fanout_failures: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let provider_requests = register_counter_vec_with_registry!(
            Opts::new("provider_requests_total", "Total outbound provider requests"),
            &["provider", "status"],
            registry
        )?;

        let provider_request_duration = register_histogram_vec_with_registry!(
            "provider_request_duration_seconds",
            "Provider request duration in seconds",
            &["provider"],
            registry
        )?;

        let provider_cost_usd = register_counter_vec_with_registry!(
            Opts::new("provider_cost_usd_total", "Accumulated provider cost in USD"),
            &["provider"],
            registry
        )?;

        let circuit_open = register_counter_vec_with_registry!(
            Opts::new("circuit_open_total", "Requests rejected by an open circuit"),
            &["provider"],
            registry
        )?;

        let cache_hits = register_counter_with_registry!(
            Opts::new("cache_hits_total", "Total cache hits"),
            registry
        )?;

        let cache_misses = register_counter_with_registry!(
            Opts::new("cache_misses_total", "Total cache misses"),
            registry
        )?;

        let cache_degraded = register_counter_with_registry!(
            Opts::new("cache_degraded_total", "Writes that fell back to the local tier only"),
            registry
        )?;

        let rate_limit_allowed = register_counter_vec_with_registry!(
            Opts::new("rate_limit_allowed_total", "Total rate limit allowed requests"),
            &["key"],
            registry
        )?;

        let rate_limit_denied = register_counter_vec_with_registry!(
            Opts::new("rate_limit_denied_total", "Total rate limit denied requests"),
            &["key"],
            registry
        )?;

        let aggregation_requests = register_counter_vec_with_registry!(
            Opts::new("aggregation_requests_total", "Total aggregation requests"),
            &["status"],
            registry
        )?;

        let aggregation_duration = register_histogram_vec_with_registry!(
            "aggregation_duration_seconds",
            "Aggregation request duration in seconds",
            &["operation"],
            registry
        )?;

        let items_deduplicated = register_counter_with_registry!(
            Opts::new("items_deduplicated_total", "Total items dropped as near-duplicates"),
            registry
        )?;

        let provider_fanout_failures = register_counter_vec_with_registry!(
            Opts::new(
                "provider_fanout_failures_total",
                "Fan-out calls that failed and were excluded from results"
            ),
            &["provider"],
            registry
        )?;

        Ok(Self {
            registry,
            provider_requests,
            provider_request_duration,
            provider_cost_usd,
            circuit_open,
            cache_hits,
            cache_misses,
            cache_degraded,
            rate_limit_allowed,
            rate_limit_denied,
            aggregation_requests,
            aggregation_duration,
            items_deduplicated,
            provider_fanout_failures,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an outbound provider request
    pub fn record_provider_request(&self, provider: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.provider_requests
            .with_label_values(&[provider, status])
            .inc();
    }

    /// Record a rate limit decision
    pub fn record_rate_limit(&self, key: &str, allowed: bool) {
        if allowed {
            self.rate_limit_allowed.with_label_values(&[key]).inc();
        } else {
            self.rate_limit_denied.with_label_values(&[key]).inc();
        }
    }

    /// Record a cache lookup
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
    }

    /// Record accrued provider cost
    pub fn record_cost(&self, provider: &str, cost_usd: f64) {
        if cost_usd > 0.0 {
            self.provider_cost_usd
                .with_label_values(&[provider])
                .inc_by(cost_usd);
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
