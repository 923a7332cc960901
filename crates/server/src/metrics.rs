//! Prometheus metrics for the stowage server.
//!
//! Exposes counters for the upload pipeline, offline downloads, recycle purges
//! and the lifecycle scheduler.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it. It
//! carries aggregate figures only (no user ids, paths or hashes), but it should
//! still be network-restricted to the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload pipeline
pub static UPLOADS_PRECHECKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_uploads_prechecked_total",
        "Total number of upload prechecks answered",
    )
    .expect("metric creation failed")
});

pub static INSTANT_UPLOADS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_instant_uploads_total",
        "Uploads satisfied by linking already stored content",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_chunks_received_total",
        "Upload chunks accepted and written",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_CORRUPT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_chunks_corrupt_total",
        "Upload chunks rejected by the MD5 check",
    )
    .expect("metric creation failed")
});

pub static FINALIZE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "stowage_finalize_duration_seconds",
            "Time spent merging, hashing, placing and committing an upload",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1200.0]),
    )
    .expect("metric creation failed")
});

pub static BYTES_INGESTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_bytes_ingested_total",
        "Plaintext bytes stored as new physical files",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stowage_upload_errors_total", "Upload failures by kind"),
        &["kind"],
    )
    .expect("metric creation failed")
});

// Offline downloads
pub static DOWNLOADS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "stowage_downloads_active",
        "Download tasks currently running a worker graph",
    )
    .expect("metric creation failed")
});

pub static DOWNLOAD_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_download_bytes_total",
        "Bytes fetched by offline downloads",
    )
    .expect("metric creation failed")
});

pub static DOWNLOAD_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_download_retries_total",
        "Segment and ingest retries performed by offline downloads",
    )
    .expect("metric creation failed")
});

// Recycle
pub static PERMANENT_DELETES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_permanent_deletes_total",
        "Recycled entries purged",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_bytes_reclaimed_total",
        "Bytes of physical files removed after their last reference went away",
    )
    .expect("metric creation failed")
});

pub static ARTIFACT_REMOVAL_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_artifact_removal_failures_total",
        "Blob artifacts that could not be removed after a purge",
    )
    .expect("metric creation failed")
});

// Scheduler
pub static SCHEDULER_JOB_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stowage_scheduler_job_runs_total", "Lifecycle job runs by job"),
        &["job"],
    )
    .expect("metric creation failed")
});

pub static SCHEDULER_JOB_PANICS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_scheduler_job_panics_total",
        "Lifecycle jobs that panicked",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_PRECHECKED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INSTANT_UPLOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_CORRUPT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FINALIZE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_INGESTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DOWNLOADS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DOWNLOAD_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DOWNLOAD_RETRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PERMANENT_DELETES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_RECLAIMED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ARTIFACT_REMOVAL_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SCHEDULER_JOB_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SCHEDULER_JOB_PANICS.clone()))
            .expect("metric registration failed");
    });
}

/// Handler for the `/metrics` endpoint.
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

/// Helper to record upload errors by kind.
pub fn record_upload_error(kind: &str) {
    UPLOAD_ERRORS.with_label_values(&[kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // This would panic if any metric creation failed
        register_metrics();
        register_metrics();
        record_upload_error("chunk_corrupt");
        assert!(UPLOAD_ERRORS.with_label_values(&["chunk_corrupt"]).get() >= 1);
    }
}
