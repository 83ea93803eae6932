//! HTTP request metrics middleware.
//!
//! Records a counter and a duration histogram for every request passing
//! through the router. Compiled only with the `metrics` feature; the module
//! is gated in `lib.rs`.

use {
    axum::{body::Body, http::Request, middleware::Next, response::Response},
    pagecast_metrics::{counter, histogram, http as http_metrics, labels},
    std::time::Instant,
};

/// Record request count and duration for the route that handled it.
pub async fn http_metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let endpoint = endpoint_label(request.uri().path());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    counter!(
        http_metrics::REQUESTS_TOTAL,
        labels::ENDPOINT => endpoint,
        labels::STATUS => status
    )
    .increment(1);
    histogram!(
        http_metrics::REQUEST_DURATION_SECONDS,
        labels::ENDPOINT => endpoint
    )
    .record(started.elapsed().as_secs_f64());

    response
}

/// Collapse the path to a fixed label set.
///
/// Every served route is static, so anything else is an unmatched probe;
/// folding those into one bucket keeps label cardinality bounded no matter
/// what clients scan for.
fn endpoint_label(path: &str) -> &'static str {
    match path {
        "/render_html" => "/render_html",
        "/render_har" => "/render_har",
        "/render_pdf" => "/render_pdf",
        "/render_png" => "/render_png",
        "/render_jpeg" => "/render_jpeg",
        "/_ping" => "/_ping",
        "/_debug" => "/_debug",
        "/_stop" => "/_stop",
        "/metrics" => "/metrics",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_paths_collapse_into_one_label() {
        assert_eq!(endpoint_label("/render_pdf"), "/render_pdf");
        assert_eq!(endpoint_label("/_ping"), "/_ping");
        assert_eq!(endpoint_label("/wp-admin/setup.php"), "other");
        assert_eq!(endpoint_label("/render_html/extra"), "other");
    }
}
