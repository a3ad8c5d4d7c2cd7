use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

use crate::models::EventKind;
use crate::{AnalyticsError, Result};

lazy_static! {
    pub static ref SERVICE_UP: IntGauge = register_int_gauge!(
        "analytics_up",
        "Whether the analytics service is serving (1) or not (0)"
    ).unwrap();

    // Request metrics
    pub static ref REQUEST_COUNTER: IntCounterVec = register_int_counter_vec!(
        "analytics_requests_total",
        "Total number of dashboard requests received",
        &["endpoint"]
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "analytics_request_duration_seconds",
        "Dashboard request duration in seconds",
        &["endpoint"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 30.0]
    ).unwrap();

    // Store metrics
    pub static ref STORE_QUERIES: IntCounterVec = register_int_counter_vec!(
        "analytics_store_queries_total",
        "Range scans issued against the event store",
        &["kind", "operation"]
    ).unwrap();

    pub static ref STORE_QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "analytics_store_query_duration_seconds",
        "Event store round trip in seconds",
        &["kind", "operation"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    pub static ref STORE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "analytics_store_errors_total",
        "Failed event store calls",
        &["kind", "operation"]
    ).unwrap();

    pub static ref ROWS_INGESTED: IntCounterVec = register_int_counter_vec!(
        "analytics_rows_ingested_total",
        "Telemetry rows written to the event store",
        &["kind"]
    ).unwrap();

    pub static ref ROWS_PURGED: IntCounter = register_int_counter!(
        "analytics_rows_purged_total",
        "Rows dropped by the retention sweep"
    ).unwrap();
}

pub fn init_metrics() {
    SERVICE_UP.set(1);
}

/// Counts a request on creation and records its latency when dropped.
pub struct RequestTimer {
    _timer: HistogramTimer,
}

impl RequestTimer {
    pub fn new(endpoint: &str) -> Self {
        REQUEST_COUNTER.with_label_values(&[endpoint]).inc();
        Self {
            _timer: REQUEST_DURATION.with_label_values(&[endpoint]).start_timer(),
        }
    }
}

pub struct StoreTimer {
    _timer: HistogramTimer,
}

impl StoreTimer {
    pub fn new(kind: EventKind, operation: &str) -> Self {
        STORE_QUERIES
            .with_label_values(&[kind.as_str(), operation])
            .inc();
        Self {
            _timer: STORE_QUERY_DURATION
                .with_label_values(&[kind.as_str(), operation])
                .start_timer(),
        }
    }
}

pub fn record_store_error(kind: EventKind, operation: &str) {
    STORE_ERRORS.with_label_values(&[kind.as_str(), operation]).inc();
}

pub fn record_rows_ingested(kind: EventKind, rows: usize) {
    ROWS_INGESTED
        .with_label_values(&[kind.as_str()])
        .inc_by(rows as u64);
}

pub fn record_rows_purged(rows: usize) {
    ROWS_PURGED.inc_by(rows as u64);
}

/// Renders the default registry in the Prometheus text format.
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buf)
        .map_err(|e| AnalyticsError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buf)
        .map_err(|e| AnalyticsError::Internal(format!("Metrics are not UTF-8: {}", e)))
}
