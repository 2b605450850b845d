//! Prometheus metrics for handle acquisitions and resets.

use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, IntCounterVec,
};
use std::time::Duration;

lazy_static::lazy_static! {
    /// Handle acquisitions by outcome (reused / recreated / failed)
    static ref DB_ACQUISITIONS: IntCounterVec = register_int_counter_vec!(
        "db_lifecycle_acquisitions_total",
        "Database handle acquisitions by outcome",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Forced handle resets by reason
    static ref DB_RESETS: IntCounterVec = register_int_counter_vec!(
        "db_lifecycle_resets_total",
        "Forced database handle resets by reason",
        &["reason"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Time to acquire a usable handle (including create + probe on the cold path)
    static ref DB_ACQUIRE_DURATION: Histogram = register_histogram!(
        "db_lifecycle_acquire_duration_seconds",
        "Time to acquire a usable database handle",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub(crate) fn record_acquisition(outcome: &str, duration: Duration) {
    DB_ACQUISITIONS.with_label_values(&[outcome]).inc();
    DB_ACQUIRE_DURATION.observe(duration.as_secs_f64());
}

pub(crate) fn record_reset(reason: &str) {
    DB_RESETS.with_label_values(&[reason]).inc();
}
