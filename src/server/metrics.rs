//! Prometheus metrics for the loglake server.

use axum::http::Method;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for HTTP request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabelsWithStatus {
    pub method: HttpMethod,
    pub endpoint: String,
    pub status: u16,
}

/// HTTP method label value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Other,
}

impl From<&Method> for HttpMethod {
    fn from(method: &Method) -> Self {
        match *method {
            Method::GET => HttpMethod::Get,
            Method::POST => HttpMethod::Post,
            Method::PUT => HttpMethod::Put,
            Method::DELETE => HttpMethod::Delete,
            Method::PATCH => HttpMethod::Patch,
            Method::HEAD => HttpMethod::Head,
            Method::OPTIONS => HttpMethod::Options,
            _ => HttpMethod::Other,
        }
    }
}

/// Labels for the latency histogram (status is unknown at request start).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: HttpMethod,
    pub endpoint: String,
}

/// Container for all Prometheus metrics.
pub struct Metrics {
    registry: Registry,

    /// Counter of log lines accepted by ingest.
    pub ingested_lines: Counter,

    /// Counter of log content bytes accepted by ingest.
    pub ingested_bytes: Counter,

    /// Gauge of chunks currently indexed.
    pub chunks_stored: Gauge,

    /// Gauge of bytes under the storage base path.
    pub storage_bytes: Gauge,

    /// Gauge of server uptime in seconds.
    pub uptime_seconds: Gauge,

    /// Counter of HTTP requests.
    pub http_requests_total: Family<HttpLabelsWithStatus, Counter>,

    /// Histogram of HTTP request latency in seconds.
    pub http_request_duration_seconds: Family<HttpLabels, Histogram>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let ingested_lines = Counter::default();
        registry.register(
            "loglake_ingested_lines",
            "Total log lines ingested",
            ingested_lines.clone(),
        );

        let ingested_bytes = Counter::default();
        registry.register(
            "loglake_ingested_bytes",
            "Total log content bytes ingested",
            ingested_bytes.clone(),
        );

        let chunks_stored = Gauge::default();
        registry.register(
            "loglake_chunks_stored",
            "Chunks currently indexed",
            chunks_stored.clone(),
        );

        let storage_bytes = Gauge::default();
        registry.register(
            "loglake_storage_bytes",
            "Bytes used under the storage base path",
            storage_bytes.clone(),
        );

        let uptime_seconds = Gauge::default();
        registry.register(
            "loglake_uptime_seconds",
            "Server uptime in seconds",
            uptime_seconds.clone(),
        );

        let http_requests_total = Family::<HttpLabelsWithStatus, Counter>::default();
        registry.register(
            "loglake_http_requests",
            "Total number of HTTP requests",
            http_requests_total.clone(),
        );

        // Buckets from 1ms to ~8s
        let http_request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 14))
            });
        registry.register(
            "loglake_http_request_duration_seconds",
            "HTTP request latency in seconds",
            http_request_duration_seconds.clone(),
        );

        Self {
            registry,
            ingested_lines,
            ingested_bytes,
            chunks_stored,
            storage_bytes,
            uptime_seconds,
            http_requests_total,
            http_request_duration_seconds,
        }
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}
