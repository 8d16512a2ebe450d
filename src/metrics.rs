//! Process-wide Prometheus metrics for query fusion
//!
//! Per-dispatcher counters live in [`DispatchMetrics`](crate::dispatch::DispatchMetrics);
//! these aggregate across every engine in the process.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // === Counters ===

    /// Families dispatched, by dialect and outcome
    pub static ref FAMILIES_TOTAL: CounterVec = register_counter_vec!(
        "fusion_families_total",
        "Compute families dispatched",
        &["dialect", "status"]
    ).unwrap();

    /// Indicator statuses produced
    pub static ref INDICATOR_STATUSES_TOTAL: CounterVec = register_counter_vec!(
        "fusion_indicator_statuses_total",
        "Per-indicator statuses produced",
        &["status"]
    ).unwrap();

    /// Dispatch retries, by reason
    pub static ref DISPATCH_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "fusion_dispatch_retries_total",
        "Backend requests retried",
        &["reason"]
    ).unwrap();

    // === Latency Histograms ===

    /// Wall time of one family from assembly to result
    pub static ref FAMILY_DURATION: HistogramVec = register_histogram_vec!(
        "fusion_family_duration_seconds",
        "Family dispatch latency in seconds",
        &["dialect"],
        vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1200.0]
    ).unwrap();

    // === Gauges ===

    /// Size of the last batch, in compute families
    pub static ref LAST_BATCH_FAMILIES: Gauge = register_gauge!(
        "fusion_last_batch_families",
        "Compute families in the most recent batch"
    ).unwrap();
}

/// Register every collector with the default registry
///
/// Safe to call more than once; engines call it on construction so the
/// families show up in [`gather_metrics`] before the first batch.
pub fn init() {
    lazy_static::initialize(&FAMILIES_TOTAL);
    lazy_static::initialize(&INDICATOR_STATUSES_TOTAL);
    lazy_static::initialize(&DISPATCH_RETRIES_TOTAL);
    lazy_static::initialize(&FAMILY_DURATION);
    lazy_static::initialize(&LAST_BATCH_FAMILIES);
    tracing::debug!("Fusion metrics registered");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a finished family
#[inline]
pub fn record_family(dialect: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    FAMILIES_TOTAL.with_label_values(&[dialect, status]).inc();
    FAMILY_DURATION
        .with_label_values(&[dialect])
        .observe(duration_secs);
}

/// Record emitted statuses
#[inline]
pub fn record_statuses(succeeded: usize, failed: usize) {
    INDICATOR_STATUSES_TOTAL
        .with_label_values(&["success"])
        .inc_by(succeeded as f64);
    INDICATOR_STATUSES_TOTAL
        .with_label_values(&["error"])
        .inc_by(failed as f64);
}

/// Record a retried backend request
#[inline]
pub fn record_retry(reason: &str) {
    DISPATCH_RETRIES_TOTAL.with_label_values(&[reason]).inc();
}

/// Update the batch size gauge
#[inline]
pub fn update_batch_families(count: usize) {
    LAST_BATCH_FAMILIES.set(count as f64);
}
