//! Request metrics for the gateway.
//!
//! Two families are registered on an explicit [`MetricsRegistry`] owned by the
//! gateway (no process-global recorder):
//! * `http_request_duration_seconds` (histogram)
//! * `http_requests_total` (counter)
//!
//! Both are labeled `{method, route, status_code}`. [`RequestTimer`] records
//! into both families exactly once, on drop, whichever way the request ends.
pub mod exposition;
pub mod registry;

use std::sync::Arc;

use tokio::time::Instant;

pub use exposition::{MetricsDocument, MetricsParseError, parse_exposition};
pub use registry::{Counter, Histogram, MetricsRegistry, RegistryError};

pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Upper bounds, in seconds, of the request duration histogram.
pub const DURATION_BUCKETS: [f64; 5] = [0.1, 0.5, 1.0, 2.0, 5.0];

/// Status recorded when a request ends without an explicit outcome.
const UNSET_STATUS: u16 = 500;

/// Request metric families plus the registry that exposes them.
#[derive(Debug)]
pub struct GatewayMetrics {
    registry: MetricsRegistry,
    request_duration: Arc<Histogram>,
    requests_total: Arc<Counter>,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, RegistryError> {
        let registry = MetricsRegistry::new();
        let request_duration = registry.register_histogram(
            HTTP_REQUEST_DURATION_SECONDS,
            "Duration of HTTP requests in seconds",
            &DURATION_BUCKETS,
        )?;
        let requests_total =
            registry.register_counter(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests")?;

        Ok(Self {
            registry,
            request_duration,
            requests_total,
        })
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn request_duration(&self) -> &Histogram {
        &self.request_duration
    }

    pub fn requests_total(&self) -> &Counter {
        &self.requests_total
    }

    /// Record one completed request.
    pub fn record_request(&self, method: &str, route: &str, status: u16, seconds: f64) {
        let status = status.to_string();
        let labels = [("method", method), ("route", route), ("status_code", status.as_str())];
        self.request_duration.observe(&labels, seconds);
        self.requests_total.inc(&labels);
    }

    /// Prometheus text exposition of every family.
    pub fn exposition(&self) -> String {
        self.registry.exposition()
    }

    /// Structured view of the current exposition.
    pub fn document(&self) -> MetricsDocument {
        parse_exposition(&self.exposition())
    }
}

/// RAII helper recording one request observation when dropped.
pub struct RequestTimer {
    metrics: Arc<GatewayMetrics>,
    start: Instant,
    method: String,
    route: String,
    status: u16,
}

impl RequestTimer {
    pub fn new(metrics: Arc<GatewayMetrics>, method: &str, route: &str) -> Self {
        Self {
            metrics,
            start: Instant::now(),
            method: method.to_string(),
            route: route.to_string(),
            status: UNSET_STATUS,
        }
    }

    /// Status code to record; the last call wins.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.metrics.record_request(
            &self.method,
            &self.route,
            self.status,
            self.start.elapsed().as_secs_f64(),
        );
    }
}
