//! Build metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all build metrics with descriptions.
pub fn register_build_metrics() {
    describe_histogram!(
        "skiff_build_duration_seconds",
        "Image build duration, including any corruption retry (by backend)"
    );
    describe_counter!("skiff_build_failures_total", "Total number of build failures (by kind)");
    describe_counter!(
        "skiff_build_corruption_retries_total",
        "Builds retried on the legacy builder after backend corruption"
    );
    describe_counter!("skiff_image_push_total", "Total number of image pushes (by outcome)");
}

pub fn record_build(duration_secs: f64, backend: &str) {
    histogram!("skiff_build_duration_seconds", "backend" => backend.to_string())
        .record(duration_secs);
}

pub fn record_build_failure(kind: &str) {
    counter!("skiff_build_failures_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_corruption_retry() {
    counter!("skiff_build_corruption_retries_total").increment(1);
}

pub fn record_push(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("skiff_image_push_total", "outcome" => outcome).increment(1);
}
