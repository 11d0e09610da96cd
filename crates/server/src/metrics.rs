//! Prometheus metrics for the courier server.
//!
//! Exposes metrics for upload sessions, chunk traffic, assembly, compression
//! and downloads. Metrics carry no codes, filenames or upload ids.
//!
//! The `/metrics` endpoint is unauthenticated; restrict it at the network
//! level when the server is reachable from untrusted clients.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload session metrics
pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "courier_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_RESUMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "courier_upload_sessions_resumed_total",
        "Total number of init calls that resumed an existing session",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EVICTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "courier_upload_sessions_evicted_total",
            "Total number of upload sessions evicted, by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static ACTIVE_UPLOAD_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "courier_active_upload_sessions",
        "Current number of live upload sessions",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "courier_chunks_received_total",
        "Total number of chunks stored",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DUPLICATE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "courier_chunks_duplicate_total",
        "Total number of chunk uploads discarded as duplicates",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "courier_bytes_received_total",
        "Total upload bytes accepted (chunks and single-shot bodies)",
    )
    .expect("metric creation failed")
});

// Artifact metrics
pub static FILES_STORED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "courier_files_stored_total",
            "Total number of files committed, by upload path",
        ),
        &["path"],
    )
    .expect("metric creation failed")
});

pub static COMPRESSION_FALLBACKS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "courier_compression_fallbacks_total",
        "Total number of compressed artifacts replaced by the uncompressed original",
    )
    .expect("metric creation failed")
});

pub static ASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "courier_assembly_duration_seconds",
            "Time taken to assemble and commit an upload",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

pub static GROUPS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("courier_groups_created_total", "Total number of groups created")
        .expect("metric creation failed")
});

// Download metrics
pub static DOWNLOADS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "courier_downloads_total",
            "Total number of artifact downloads, by encoding served",
        ),
        &["encoding"],
    )
    .expect("metric creation failed")
});

pub static DECOMPRESSION_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "courier_decompression_failures_total",
        "Total number of stored artifacts that failed to decode",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "courier_upload_errors_total",
            "Total upload errors by error type",
        ),
        &["error_type"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so integration tests can build many routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_RESUMED.clone()),
            Box::new(UPLOAD_SESSIONS_EVICTED.clone()),
            Box::new(ACTIVE_UPLOAD_SESSIONS.clone()),
            Box::new(CHUNKS_RECEIVED.clone()),
            Box::new(CHUNKS_DUPLICATE.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(FILES_STORED.clone()),
            Box::new(COMPRESSION_FALLBACKS.clone()),
            Box::new(ASSEMBLY_DURATION.clone()),
            Box::new(GROUPS_CREATED.clone()),
            Box::new(DOWNLOADS.clone()),
            Box::new(DECOMPRESSION_FAILURES.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
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

/// Helper to record upload errors by type.
pub fn record_upload_error(error_type: &str) {
    UPLOAD_ERRORS.with_label_values(&[error_type]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        record_upload_error("test");
        assert!(
            REGISTRY
                .gather()
                .iter()
                .any(|f| f.name() == "courier_upload_errors_total")
        );
    }
}
