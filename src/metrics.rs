//! Prometheus metrics for the peerd daemon.
//!
//! All metrics are registered on construction and exported at the
//! `/metrics` HTTP endpoint in the Prometheus text format.
//!
//! # Key Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `peerd_http_requests_total` | Counter | Peer-surface requests by method/status |
//! | `peerd_request_duration_seconds` | Histogram | Peer-surface latency by method |
//! | `peerd_chunk_peer_hits_total` | Counter | Chunks served by a peer |
//! | `peerd_chunk_peer_misses_total` | Counter | Peer attempts that failed |
//! | `peerd_chunk_origin_fetches_total` | Counter | Chunks fetched from the origin |
//! | `peerd_resolve_negative_hits_total` | Counter | Resolves answered by the negative cache |
//! | `peerd_active_fetches` | Gauge | In-flight `read` calls |

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Prometheus metrics collection for the daemon.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<RwLock<Registry>>,
    pub http_requests: Family<[(String, String); 2], Counter>, // method, status
    pub http_duration: Family<[(String, String); 1], Histogram>, // method
    pub peer_hits: Counter,
    pub peer_misses: Counter,
    pub origin_fetches: Counter,
    pub origin_failures: Counter,
    pub negative_cache_hits: Counter,
    pub active_fetches: Gauge,
    pub bytes_served: Counter,
    pub bytes_from_peers: Counter,
    pub bytes_from_origin: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<[(String, String); 2], Counter>::default();
        registry.register(
            "peerd_http_requests",
            "Total peer-surface HTTP requests handled",
            http_requests.clone(),
        );

        let http_duration =
            Family::<[(String, String); 1], Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 12))
            });
        registry.register(
            "peerd_request_duration_seconds",
            "Peer-surface HTTP request duration",
            http_duration.clone(),
        );

        let peer_hits = Counter::default();
        registry.register(
            "peerd_chunk_peer_hits",
            "Chunks successfully fetched from a peer",
            peer_hits.clone(),
        );

        let peer_misses = Counter::default();
        registry.register(
            "peerd_chunk_peer_misses",
            "Per-peer fetch attempts that failed or were refused",
            peer_misses.clone(),
        );

        let origin_fetches = Counter::default();
        registry.register(
            "peerd_chunk_origin_fetches",
            "Chunks fetched from the upstream origin",
            origin_fetches.clone(),
        );

        let origin_failures = Counter::default();
        registry.register(
            "peerd_chunk_origin_failures",
            "Origin fetches that exhausted the retry budget",
            origin_failures.clone(),
        );

        let negative_cache_hits = Counter::default();
        registry.register(
            "peerd_resolve_negative_hits",
            "Resolutions suppressed by the negative cache",
            negative_cache_hits.clone(),
        );

        let active_fetches = Gauge::default();
        registry.register(
            "peerd_active_fetches",
            "In-flight fetch-engine read calls",
            active_fetches.clone(),
        );

        let bytes_served = Counter::default();
        registry.register(
            "peerd_bytes_served",
            "Bytes served to peers over the HTTP surface",
            bytes_served.clone(),
        );

        let bytes_from_peers = Counter::default();
        registry.register(
            "peerd_bytes_from_peers",
            "Bytes fetched from peers",
            bytes_from_peers.clone(),
        );

        let bytes_from_origin = Counter::default();
        registry.register(
            "peerd_bytes_from_origin",
            "Bytes fetched from the origin",
            bytes_from_origin.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            http_requests,
            http_duration,
            peer_hits,
            peer_misses,
            origin_fetches,
            origin_failures,
            negative_cache_hits,
            active_fetches,
            bytes_served,
            bytes_from_peers,
            bytes_from_origin,
        }
    }

    /// Encode the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Err(e) = encode(&mut out, &self.registry.read()) {
            tracing::error!(error = %e, "metrics encoding failed");
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_contains_registered_metrics() {
        let metrics = Metrics::new();
        metrics.peer_hits.inc();
        metrics.active_fetches.set(3);

        let text = metrics.encode();
        assert!(text.contains("peerd_chunk_peer_hits_total 1"));
        assert!(text.contains("peerd_active_fetches 3"));
    }
}
