//! Prometheus metric registration and the `/metrics` handler.
//!
//! Kept near-verbatim from the reference's `MetricsRecorder` (install once at
//! startup, `describe_*` up front, `PrometheusHandle` cloned into the router
//! state); only the metric names are this runtime's own.

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("ingest_messages_persisted_total", "Messages successfully persisted");
        metrics::describe_counter!("ingest_publish_failures_total", "Event log publish failures after a successful write");
        metrics::describe_counter!("ingest_rejections_total", "Ingest requests rejected before persistence");
        metrics::describe_histogram!("ingest_pipeline_duration_seconds", "End-to-end persist_message latency");

        metrics::describe_counter!("fanout_deliveries_total", "Successful per-connection deliveries");
        metrics::describe_counter!("fanout_delivery_exhausted_total", "Events dropped after exhausting the retry budget");
        metrics::describe_histogram!("fanout_poll_duration_seconds", "Event log poll-to-commit latency");

        metrics::describe_gauge!("connection_gateway_active_connections", "Live WebSocket connections on this process");
        metrics::describe_counter!("connection_gateway_accepts_total", "Accepted WebSocket upgrades");
        metrics::describe_counter!("connection_gateway_rejections_total", "Rejected connection attempts, by reason");
        metrics::describe_counter!("connection_gateway_slow_consumer_total", "Connections closed for a full outbound queue");

        metrics::describe_counter!("sync_requests_total", "sync_request frames served");
        metrics::describe_histogram!("sync_page_size", "Page sizes returned by Sync");

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}
