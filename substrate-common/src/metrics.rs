//! Prometheus metrics for substrate calls

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};
use std::time::Instant;

lazy_static! {
    /// Total boundary calls
    pub static ref SUBSTRATE_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "substrate_calls_total",
        "Total substrate boundary calls",
        &["operation", "status"]
    )
    .unwrap();

    /// Boundary call duration
    pub static ref SUBSTRATE_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "substrate_call_duration_seconds",
        "Substrate boundary call duration in seconds",
        &["operation"]
    )
    .unwrap();

    /// Batch entries dispatched
    pub static ref BATCH_ENTRIES_TOTAL: CounterVec = register_counter_vec!(
        "substrate_batch_entries_total",
        "Total batch entries dispatched",
        &["batch", "status"]
    )
    .unwrap();
}

/// Record one boundary call
pub fn observe_call(operation: &str, started: Instant, ok: bool) {
    SUBSTRATE_CALL_DURATION
        .with_label_values(&[operation])
        .observe(started.elapsed().as_secs_f64());

    let status = if ok { "success" } else { "error" };
    SUBSTRATE_CALLS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Record one dispatched batch entry
pub fn observe_batch_entry(batch: &str, status: &str) {
    BATCH_ENTRIES_TOTAL.with_label_values(&[batch, status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_call() {
        let before = SUBSTRATE_CALLS_TOTAL
            .with_label_values(&["metrics_test", "success"])
            .get();
        observe_call("metrics_test", Instant::now(), true);
        let after = SUBSTRATE_CALLS_TOTAL
            .with_label_values(&["metrics_test", "success"])
            .get();
        assert_eq!(after - before, 1.0);
    }

    #[test]
    fn test_observe_batch_entry() {
        observe_batch_entry("metrics_test_batch", "failed");
        assert!(
            BATCH_ENTRIES_TOTAL
                .with_label_values(&["metrics_test_batch", "failed"])
                .get()
                >= 1.0
        );
    }
}
