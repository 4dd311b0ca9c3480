// src/utils/metrics.rs

use once_cell::sync::Lazy;
use prometheus::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};

// Router metrics
pub static DOCUMENTS_INGESTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "router_documents_ingested_total",
        "Total number of documents admitted into the pipeline."
    )
    .expect("Failed to register DOCUMENTS_INGESTED_TOTAL counter")
});

pub static INGESTS_SKIPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "router_ingests_skipped_total",
        "Total number of ingest requests skipped as duplicates."
    )
    .expect("Failed to register INGESTS_SKIPPED_TOTAL counter")
});

pub static JOBS_DISPATCHED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "router_jobs_dispatched_total",
        "Total number of process messages enqueued."
    )
    .expect("Failed to register JOBS_DISPATCHED_TOTAL counter")
});

pub static JOBS_RETRIED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "router_jobs_retried_total",
        "Total number of retry attempts created for failed or timed-out jobs."
    )
    .expect("Failed to register JOBS_RETRIED_TOTAL counter")
});

pub static DOCUMENTS_COMPLETED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "router_documents_completed_total",
        "Total number of documents that reached the end of the pipeline."
    )
    .expect("Failed to register DOCUMENTS_COMPLETED_TOTAL counter")
});

pub static DOCUMENTS_FAILED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "router_documents_failed_total",
        "Total number of documents that terminally failed."
    )
    .expect("Failed to register DOCUMENTS_FAILED_TOTAL counter")
});

// Worker metrics
pub static JOBS_COMPLETED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_jobs_completed_total",
        "Total number of jobs completed successfully."
    )
    .expect("Failed to register JOBS_COMPLETED_TOTAL counter")
});

pub static JOBS_FAILED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_jobs_failed_total",
        "Total number of jobs that failed during stage execution."
    )
    .expect("Failed to register JOBS_FAILED_TOTAL counter")
});

pub static JOBS_TIMED_OUT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_jobs_timed_out_total",
        "Total number of jobs terminated by the timeout enforcer."
    )
    .expect("Failed to register JOBS_TIMED_OUT_TOTAL counter")
});

pub static LATE_RESULTS_DISCARDED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_late_results_discarded_total",
        "Total number of stage results discarded because the attempt had already timed out or been cancelled."
    )
    .expect("Failed to register LATE_RESULTS_DISCARDED_TOTAL counter")
});

pub static QUOTA_CHECKS_DENIED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_quota_checks_denied_total",
        "Total number of jobs denied admission by a quota check."
    )
    .expect("Failed to register QUOTA_CHECKS_DENIED_TOTAL counter")
});

pub static HEARTBEATS_RECORDED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_heartbeats_recorded_total",
        "Total number of heartbeats recorded for running jobs."
    )
    .expect("Failed to register HEARTBEATS_RECORDED_TOTAL counter")
});

pub static ACTIVE_RUNNING_JOBS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "worker_active_running_jobs",
        "Number of jobs currently executing on this worker."
    )
    .expect("Failed to register ACTIVE_RUNNING_JOBS gauge")
});

pub static JOB_EXECUTION_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "worker_job_execution_duration_seconds",
        "Histogram of stage execution durations (from claim to terminal status)."
    )
    .expect("Failed to register JOB_EXECUTION_DURATION_SECONDS histogram")
});

/// Serves the Prometheus text endpoint on `/metrics`.
pub async fn serve_metrics(port: u16) -> crate::error::Result<()> {
    use axum::{routing::get, Router};

    async fn metrics_handler() -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Serving Prometheus metrics");
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::PipelineError::Unexpected(e.to_string()))
}
