//! Prometheus metrics instrumentation for quarry.
//!
//! All metrics are conditionally compiled behind the `metrics` feature
//! flag; the recording helpers in [`crate::telemetry`] become no-ops
//! without it.
//!
//! # Metrics
//!
//! ## Counters
//! - `quarry_jobs_added_total` - Jobs accepted into the engine
//! - `quarry_jobs_finished_total` - Attempts finished, by outcome
//!
//! ## Gauges
//! - `quarry_queue_depth` - Jobs currently queued
//!
//! ## Histograms
//! - `quarry_job_duration_seconds` - Attempt duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for quarry metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs accepted into the engine.
///
/// Labels:
/// - `kind`: The handler kind
pub static JOBS_ADDED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("quarry_jobs_added_total", "Jobs accepted into the engine");
    CounterVec::new(opts, &["kind"]).expect("quarry_jobs_added_total metric creation failed")
});

/// Counter for finished attempts.
///
/// Labels:
/// - `kind`: The handler kind
/// - `outcome`: success, retry, or cancelled
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("quarry_jobs_finished_total", "Finished job attempts");
    CounterVec::new(opts, &["kind", "outcome"])
        .expect("quarry_jobs_finished_total metric creation failed")
});

/// Gauge for the number of queued jobs.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("quarry_queue_depth", "Jobs currently queued");
    GaugeVec::new(opts, &["queue"]).expect("quarry_queue_depth metric creation failed")
});

/// Histogram for attempt duration in seconds.
///
/// Labels:
/// - `kind`: The handler kind
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "quarry_job_duration_seconds",
        "Job attempt duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["kind"])
        .expect("quarry_job_duration_seconds metric creation failed")
});

/// Register all quarry metrics with the global registry.
///
/// Call once at startup; registering twice returns an error from
/// prometheus and is reported as such.
pub fn register_all() -> anyhow::Result<()> {
    REGISTRY.register(Box::new(JOBS_ADDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        register_all().expect("first registration succeeds");
        assert!(register_all().is_err(), "second registration is rejected");

        JOBS_ADDED_TOTAL.with_label_values(&["adhoc"]).inc();
        JOBS_FINISHED_TOTAL
            .with_label_values(&["adhoc", "success"])
            .inc();
        QUEUE_DEPTH.with_label_values(&["memory"]).set(3.0);
        JOB_DURATION_SECONDS
            .with_label_values(&["adhoc"])
            .observe(0.25);
    }
}
