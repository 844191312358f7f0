//! Prometheus metrics for Revamp Proxy
//!
//! One registry for the whole process, published by the Captive Portal's diagnostic page and
//! scrapeable directly off `Registry::gather`. Metric names use the `revamp_proxy_*` prefix.

use std::sync::Arc;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Request metrics
    pub requests_total: CounterVec,
    pub requests_in_flight: Gauge,
    pub request_duration_seconds: HistogramVec,
    pub response_size_bytes: Histogram,
    pub bad_gateway_total: Counter,
    pub blocked_requests_total: Counter,

    // Cache metrics
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub cache_bypasses_total: Counter,
    pub cache_entries: Gauge,
    pub cache_size_bytes: Gauge,

    // Transform metrics
    pub transform_duration_seconds: HistogramVec,
    pub transform_errors_total: CounterVec,

    // TLS / certificate metrics
    pub tls_handshakes_total: CounterVec,
    pub leaf_certs_minted_total: Counter,

    // Frontend connection metrics
    pub socks5_connections_total: Counter,
    pub websocket_upgrades_total: Counter,
}

impl Metrics {
    /// Create a new registry with every metric registered.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("revamp_proxy_requests_total", "Total number of HTTP requests"),
            &["method", "status", "cache_status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_in_flight = Gauge::new(
            "revamp_proxy_requests_in_flight",
            "Number of requests currently being processed",
        )?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "revamp_proxy_request_duration_seconds",
                "Request duration in seconds, from accept to last response byte",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "cache_status"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let response_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "revamp_proxy_response_size_bytes",
                "Response size in bytes as delivered to the client",
            )
            .buckets(vec![100.0, 1000.0, 10000.0, 100000.0, 1000000.0, 10000000.0]),
        )?;
        registry.register(Box::new(response_size_bytes.clone()))?;

        let bad_gateway_total = Counter::new(
            "revamp_proxy_bad_gateway_total",
            "Total requests answered with 502 due to an origin failure",
        )?;
        registry.register(Box::new(bad_gateway_total.clone()))?;

        let blocked_requests_total = Counter::new(
            "revamp_proxy_blocked_requests_total",
            "Total requests short-circuited to 204 by the block list",
        )?;
        registry.register(Box::new(blocked_requests_total.clone()))?;

        let cache_hits_total =
            Counter::new("revamp_proxy_cache_hits_total", "Total number of cache hits")?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = Counter::new(
            "revamp_proxy_cache_misses_total",
            "Total number of cache misses",
        )?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let cache_bypasses_total = Counter::new(
            "revamp_proxy_cache_bypasses_total",
            "Total responses that bypassed the cache (streaming/oversize/other content)",
        )?;
        registry.register(Box::new(cache_bypasses_total.clone()))?;

        let cache_entries = Gauge::new(
            "revamp_proxy_cache_entries",
            "Current number of in-memory cache entries",
        )?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_size_bytes = Gauge::new(
            "revamp_proxy_cache_size_bytes",
            "Current in-memory cache size in bytes",
        )?;
        registry.register(Box::new(cache_size_bytes.clone()))?;

        let transform_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "revamp_proxy_transform_duration_seconds",
                "Time spent inside the Transformer Pool per content kind",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["content_kind"],
        )?;
        registry.register(Box::new(transform_duration_seconds.clone()))?;

        let transform_errors_total = CounterVec::new(
            Opts::new(
                "revamp_proxy_transform_errors_total",
                "Total transform failures by content kind and ignorability",
            ),
            &["content_kind", "ignorable"],
        )?;
        registry.register(Box::new(transform_errors_total.clone()))?;

        let tls_handshakes_total = CounterVec::new(
            Opts::new("revamp_proxy_tls_handshakes_total", "Total MITM TLS handshakes"),
            &["status"],
        )?;
        registry.register(Box::new(tls_handshakes_total.clone()))?;

        let leaf_certs_minted_total = Counter::new(
            "revamp_proxy_leaf_certs_minted_total",
            "Total leaf certificates minted (excludes LRU cache hits)",
        )?;
        registry.register(Box::new(leaf_certs_minted_total.clone()))?;

        let socks5_connections_total = Counter::new(
            "revamp_proxy_socks5_connections_total",
            "Total SOCKS5 client connections accepted",
        )?;
        registry.register(Box::new(socks5_connections_total.clone()))?;

        let websocket_upgrades_total = Counter::new(
            "revamp_proxy_websocket_upgrades_total",
            "Total requests spliced as a raw WebSocket upgrade, bypassing the Pipeline",
        )?;
        registry.register(Box::new(websocket_upgrades_total.clone()))?;

        Ok(Metrics {
            registry,
            requests_total,
            requests_in_flight,
            request_duration_seconds,
            response_size_bytes,
            bad_gateway_total,
            blocked_requests_total,
            cache_hits_total,
            cache_misses_total,
            cache_bypasses_total,
            cache_entries,
            cache_size_bytes,
            transform_duration_seconds,
            transform_errors_total,
            tls_handshakes_total,
            leaf_certs_minted_total,
            socks5_connections_total,
            websocket_upgrades_total,
        })
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn export(&self) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Cache hit rate in `[0.0, 1.0]`, used by the Captive Portal's diagnostic page.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits_total.get();
        let misses = self.cache_misses_total.get();
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metric registration only fails on a duplicate name, which this set never has")
    }
}

/// RAII helper recording one request's in-flight gauge, duration, and final label set.
pub struct RequestMetricsGuard {
    metrics: Arc<Metrics>,
    start: std::time::Instant,
    method: String,
    cache_status: String,
}

impl RequestMetricsGuard {
    pub fn new(metrics: Arc<Metrics>, method: String) -> Self {
        metrics.requests_in_flight.inc();
        Self {
            metrics,
            start: std::time::Instant::now(),
            method,
            cache_status: "unknown".to_string(),
        }
    }

    pub fn set_cache_status(&mut self, status: &str) {
        self.cache_status = status.to_string();
    }

    pub fn finish(self, status_code: u16, response_size: usize) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics.requests_in_flight.dec();
        self.metrics
            .requests_total
            .with_label_values(&[&self.method, &status_code.to_string(), &self.cache_status])
            .inc();
        self.metrics
            .request_duration_seconds
            .with_label_values(&[&self.method, &self.cache_status])
            .observe(duration);
        self.metrics.response_size_bytes.observe(response_size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_duplicate_name_conflicts() {
        let metrics = Metrics::new().unwrap();
        metrics.export().unwrap();
    }

    #[test]
    fn cache_hit_rate_is_zero_with_no_samples() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
    }

    #[test]
    fn cache_hit_rate_reflects_hits_and_misses() {
        let metrics = Metrics::new().unwrap();
        metrics.cache_hits_total.inc();
        metrics.cache_hits_total.inc();
        metrics.cache_misses_total.inc();
        assert!((metrics.cache_hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn request_guard_records_a_sample() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut guard = RequestMetricsGuard::new(Arc::clone(&metrics), "GET".to_string());
        guard.set_cache_status("hit");
        guard.finish(200, 1024);

        let families = metrics.registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"revamp_proxy_requests_total"));
    }
}
