//! Metrics collector using prometheus-client.
//!
//! Tracks request counts, latency, active connections, and backend health.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub backend: String,
    pub method: String,
    pub status: String,
}

/// Labels for per-backend metrics (duration, connections, health).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<BackendLabels, Histogram>,
    active_connections: Family<BackendLabels, Gauge>,
    backend_health: Family<BackendLabels, Gauge>,
    registry: Registry,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds = Family::<BackendLabels, Histogram>::new_with_constructor(|| {
            // Buckets: 1ms, 2.5ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
            Histogram::new(exponential_buckets(0.001, 2.5, 13))
        });
        let active_connections = Family::<BackendLabels, Gauge>::default();
        let backend_health = Family::<BackendLabels, Gauge>::default();

        registry.register(
            "revproxy_lb_requests",
            "Total number of requests forwarded",
            requests_total.clone(),
        );
        registry.register(
            "revproxy_lb_request_duration_seconds",
            "Forwarded request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "revproxy_lb_active_connections",
            "Number of in-flight requests per backend",
            active_connections.clone(),
        );
        registry.register(
            "revproxy_lb_backend_health",
            "Backend health status (1=healthy, 0=unhealthy)",
            backend_health.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                active_connections,
                backend_health,
                registry,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a completed forwarded request.
    pub fn record_request(&self, backend: &str, method: &str, status: u16, duration: std::time::Duration) {
        let labels = RequestLabels {
            backend: backend.to_string(),
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();

        let backend_labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .request_duration_seconds
            .get_or_create(&backend_labels)
            .observe(duration.as_secs_f64());
    }

    pub fn connection_opened(&self, backend: &str) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner.active_connections.get_or_create(&labels).inc();
    }

    pub fn connection_closed(&self, backend: &str) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner.active_connections.get_or_create(&labels).dec();
    }

    pub fn set_backend_health(&self, backend: &str, healthy: bool) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .backend_health
            .get_or_create(&labels)
            .set(if healthy { 1 } else { 0 });
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
