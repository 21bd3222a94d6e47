//! Prometheus metrics for the roll-up store
//!
//! Counters and histograms are registered in the default registry on first
//! use; [`gather_metrics`] renders them in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Write path ===

    /// Metrics accepted by `save`
    pub static ref METRICS_SAVED: Counter = register_counter!(
        "rollup_metrics_saved_total",
        "Metrics accepted by save"
    ).unwrap();

    /// Null entries skipped by `save`
    pub static ref METRICS_SKIPPED: Counter = register_counter!(
        "rollup_metrics_skipped_total",
        "Null metrics skipped by save"
    ).unwrap();

    /// Mutations handed to the index writers
    pub static ref MUTATIONS_WRITTEN: CounterVec = register_counter_vec!(
        "rollup_mutations_written_total",
        "Mutations buffered per index table",
        &["index"]
    ).unwrap();

    /// `save` latency including the final flush
    pub static ref SAVE_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_save_duration_seconds",
        "Save latency in seconds",
        &["status"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // === Read path ===

    /// Queries opened
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_queries_total",
        "Queries opened",
        &["index", "unit", "mode"]
    ).unwrap();

    /// Cells decoded into metrics
    pub static ref CELLS_DECODED: Counter = register_counter!(
        "rollup_cells_decoded_total",
        "Scanned cells decoded into metrics"
    ).unwrap();

    /// Scans aborted by a decode or store error
    pub static ref DECODE_FAILURES: Counter = register_counter!(
        "rollup_decode_failures_total",
        "Scans aborted by a decode or store error"
    ).unwrap();

    /// Time from `query` call to an open scan
    pub static ref QUERY_SETUP_DURATION: Histogram = register_histogram!(
        "rollup_query_setup_duration_seconds",
        "Query setup latency in seconds",
        vec![0.0001, 0.001, 0.01, 0.1, 1.0]
    ).unwrap();
}

/// Render every registered metric in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a finished `save` call
#[inline]
pub fn record_save(saved: usize, skipped: usize, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };
    METRICS_SAVED.inc_by(saved as f64);
    METRICS_SKIPPED.inc_by(skipped as f64);
    SAVE_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record mutations buffered for one index table
#[inline]
pub fn record_mutations(index: &str, count: usize) {
    MUTATIONS_WRITTEN
        .with_label_values(&[index])
        .inc_by(count as f64);
}

/// Record an opened query
#[inline]
pub fn record_query(index: &str, unit: &str, mode: &str, setup_secs: f64) {
    QUERIES_TOTAL.with_label_values(&[index, unit, mode]).inc();
    QUERY_SETUP_DURATION.observe(setup_secs);
}
