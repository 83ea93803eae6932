//! Prometheus scrape endpoint.

use {
    crate::server::AppState,
    axum::{
        extract::State,
        http::{StatusCode, header},
        response::{IntoResponse, Response},
    },
};

/// Prometheus metrics endpoint handler.
///
/// Text exposition format, unauthenticated so scrapers can reach it.
/// Answers 503 when the recorder was not installed (metrics disabled in
/// config).
pub async fn prometheus_metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics_handle.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics are not enabled",
        )
            .into_response(),
    }
}
