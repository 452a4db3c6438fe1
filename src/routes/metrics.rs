use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for every metric the pipeline emits.
pub fn describe_metrics() {
    metrics::describe_counter!("processing_jobs_total", "Processing jobs enqueued");
    metrics::describe_counter!("processing_jobs_completed", "Processing jobs that completed");
    metrics::describe_counter!(
        "processing_jobs_failed",
        "Processing jobs that failed with no further attempt"
    );
    metrics::describe_counter!("processing_jobs_retried", "Processing attempts scheduled for retry");
    metrics::describe_counter!(
        "processing_jobs_skipped",
        "Processing jobs for videos that had already settled"
    );
    metrics::describe_counter!("webhook_deliveries_total", "Webhook delivery attempts by outcome");
    metrics::describe_counter!("queue_dead_lettered_total", "Jobs moved to a dead-letter state");
    metrics::describe_histogram!(
        "processing_duration_seconds",
        "Wall-clock time from job acceptance to completion"
    );
    metrics::describe_gauge!("queue_depth", "Jobs per queue and state");
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
