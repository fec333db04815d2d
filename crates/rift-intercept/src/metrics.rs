//! Prometheus metrics for rift-intercept.
//!
//! Tracks call outcomes, certificate issuance, cache corruption and
//! outstanding correlations.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Intercepted calls by terminal outcome
    pub static ref CALLS_TOTAL: CounterVec = register_counter_vec!(
        "rift_intercept_calls_total",
        "Total number of intercepted calls by outcome",
        &["outcome"]  // outcome: passthrough|replayed|recorded|error
    )
    .unwrap();

    /// End-to-end call duration
    pub static ref CALL_DURATION_MS: HistogramVec = register_histogram_vec!(
        "rift_intercept_call_duration_ms",
        "Histogram of intercepted call duration in milliseconds",
        &["outcome"],
        vec![0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap();

    /// Leaf certificates issued by the CA
    pub static ref CERTIFICATES_ISSUED_TOTAL: CounterVec = register_counter_vec!(
        "rift_intercept_certificates_issued_total",
        "Total number of leaf certificates issued",
        &["result"]  // result: issued|error
    )
    .unwrap();

    /// Cached payloads that could not be read and fell back to a live call
    pub static ref CACHE_CORRUPTION_TOTAL: CounterVec = register_counter_vec!(
        "rift_intercept_cache_corruption_total",
        "Total number of unreadable cached payloads",
        &["policy"]
    )
    .unwrap();

    /// Correlation tokens issued but not yet consumed or released
    pub static ref OUTSTANDING_CORRELATIONS: IntGauge = register_int_gauge!(
        "rift_intercept_outstanding_correlations",
        "Number of correlation tokens awaiting extraction"
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper to record a finished call
pub fn record_call(outcome: &str, duration_ms: f64) {
    CALLS_TOTAL.with_label_values(&[outcome]).inc();
    CALL_DURATION_MS
        .with_label_values(&[outcome])
        .observe(duration_ms);
}

/// Helper to record certificate issuance
pub fn record_certificate(result: &str) {
    CERTIFICATES_ISSUED_TOTAL.with_label_values(&[result]).inc();
}

/// Helper to record a corrupt cache entry
pub fn record_cache_corruption(policy: &str) {
    CACHE_CORRUPTION_TOTAL.with_label_values(&[policy]).inc();
}
