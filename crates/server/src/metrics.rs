//! Prometheus metrics for the vreg server.
//!
//! Labels never carry registry, upstream or artifact identifiers, only
//! outcome classes, so cardinality stays fixed.
//!
//! The `/metrics` endpoint is unauthenticated. Restrict it to scrapers at
//! the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Artifact serving
pub static CACHE_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vreg_cache_requests_total",
            "Artifact requests by cache result (hit, miss, stale, revalidated)",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static FETCHES_COALESCED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_fetches_coalesced_total",
        "Requests that attached to an in-flight upstream fetch",
    )
    .expect("metric creation failed")
});

pub static FETCHES_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "vreg_fetches_in_flight",
        "Upstream fetches currently running",
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_upstream_bytes_total",
        "Bytes received from upstreams and stored",
    )
    .expect("metric creation failed")
});

pub static SERVED_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("vreg_served_bytes_total", "Artifact bytes served to clients")
        .expect("metric creation failed")
});

pub static UPSTREAM_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vreg_upstream_errors_total",
            "Upstream fetch failures by class",
        ),
        &["class"],
    )
    .expect("metric creation failed")
});

pub static FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vreg_upstream_fetch_duration_seconds",
            "Time from first upstream attempt to stored entry",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

pub static INTEGRITY_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_integrity_mismatches_total",
        "Fetched artifacts rejected because declared checksums did not match",
    )
    .expect("metric creation failed")
});

// Cleanup
pub static CLEANUP_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("vreg_cleanup_runs_total", "Cleanup runs by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static CLEANUP_DELETED_ENTRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_cleanup_deleted_entries_total",
        "Cache entries evicted by cleanup runs",
    )
    .expect("metric creation failed")
});

pub static CLEANUP_DELETED_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_cleanup_deleted_bytes_total",
        "Bytes of cache entries evicted by cleanup runs",
    )
    .expect("metric creation failed")
});

pub static CLEANUP_RUN_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vreg_cleanup_run_duration_seconds",
            "Cleanup run duration",
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
    )
    .expect("metric creation failed")
});

// Blob deletion queue
pub static BLOB_GC_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_blob_gc_deleted_total",
        "Blob deletion tasks completed",
    )
    .expect("metric creation failed")
});

pub static BLOB_GC_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_blob_gc_failures_total",
        "Blob deletion attempts that failed and were rescheduled",
    )
    .expect("metric creation failed")
});

pub static BLOB_GC_PARKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_blob_gc_parked_total",
        "Blob deletion tasks that exhausted their attempts",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(CACHE_REQUESTS.clone()),
            Box::new(FETCHES_COALESCED.clone()),
            Box::new(FETCHES_IN_FLIGHT.clone()),
            Box::new(UPSTREAM_BYTES.clone()),
            Box::new(SERVED_BYTES.clone()),
            Box::new(UPSTREAM_ERRORS.clone()),
            Box::new(FETCH_DURATION.clone()),
            Box::new(INTEGRITY_MISMATCHES.clone()),
            Box::new(CLEANUP_RUNS.clone()),
            Box::new(CLEANUP_DELETED_ENTRIES.clone()),
            Box::new(CLEANUP_DELETED_BYTES.clone()),
            Box::new(CLEANUP_RUN_DURATION.clone()),
            Box::new(BLOB_GC_DELETED.clone()),
            Box::new(BLOB_GC_FAILURES.clone()),
            Box::new(BLOB_GC_PARKED.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Count an artifact request by cache result.
pub fn record_cache_result(result: &str) {
    CACHE_REQUESTS.with_label_values(&[result]).inc();
}

/// Count an upstream failure by class.
pub fn record_upstream_error(class: &str) {
    UPSTREAM_ERRORS.with_label_values(&[class]).inc();
}
