//! Prometheus metrics for the Beacon janitor.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! Labels carry job types and outcomes only, never repository names.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Job metrics
pub static JOB_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "beacon_janitor_job_runs_total",
            "Janitor job runs by type and outcome",
        ),
        &["job_type", "outcome"],
    )
    .expect("metric creation failed")
});

pub static UPLOADS_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "beacon_janitor_uploads_deleted_total",
            "Uploads deleted by janitor jobs",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static UPLOADS_UPDATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "beacon_janitor_uploads_updated_total",
            "Uploads updated in place by janitor jobs",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "beacon_janitor_job_duration_seconds",
            "Janitor job duration by type and state",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]),
        &["job_type", "state"],
    )
    .expect("metric creation failed")
});

pub static JOBS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "beacon_janitor_jobs_active",
        "Number of janitor jobs currently running",
    )
    .expect("metric creation failed")
});

pub static JOBS_PANICKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "beacon_janitor_jobs_panicked_total",
        "Total number of janitor jobs that panicked",
    )
    .expect("metric creation failed")
});

// Visibility metrics
pub static DIRTY_REPOSITORIES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "beacon_dirty_repositories",
        "Repositories whose visibility data was stale at the last visibility run",
    )
    .expect("metric creation failed")
});

pub static VISIBILITY_RECOMPUTATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "beacon_visibility_recomputations_total",
            "Per-repository visibility recomputations by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedded routers can call it freely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(JOB_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_UPDATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_PANICKED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DIRTY_REPOSITORIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(VISIBILITY_RECOMPUTATIONS.clone()))
            .expect("metric registration failed");
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

/// Record the outcome of one visibility recomputation.
pub fn record_visibility_outcome(outcome: &str) {
    VISIBILITY_RECOMPUTATIONS
        .with_label_values(&[outcome])
        .inc();
}
