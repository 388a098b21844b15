//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics;
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_metrics_from_state(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Topic gauges are sampled at scrape time
fn update_metrics_from_state(state: &AppState) {
    let topics = state.hub.registry().stats().topics;
    metrics::TOPICS_ACTIVE
        .with_label_values(&["channel"])
        .set(topics.channels as i64);
    metrics::TOPICS_ACTIVE
        .with_label_values(&["dm"])
        .set(topics.dm_threads as i64);
    metrics::TOPICS_ACTIVE
        .with_label_values(&["user"])
        .set(topics.users as i64);
}
