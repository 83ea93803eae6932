//! Render routes and server lifecycle.

use {
    axum::{
        Router,
        extract::{Query, State, rejection::QueryRejection},
        http::{StatusCode, header},
        response::{IntoResponse, Json, Response},
        routing::get,
    },
    pagecast_browser::{RenderAction, RenderError, RenderOutput, RenderRequest, RenderService},
    pagecast_config::PagecastConfig,
    std::{net::SocketAddr, sync::Arc},
    tokio::sync::watch,
    tower_http::cors::{Any, CorsLayer},
    tracing::{error, info},
};

/// Shared state for every route handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RenderService>,
    /// Sending `true` asks the serve loop to drain and exit.
    pub shutdown: watch::Sender<bool>,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<pagecast_metrics::MetricsHandle>,
}

/// Build the pagecast router (shared between production startup and tests).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/render_html", get(render_html_handler))
        .route("/render_har", get(render_har_handler))
        .route("/render_pdf", get(render_pdf_handler))
        .route("/render_png", get(render_png_handler))
        .route("/render_jpeg", get(render_jpeg_handler))
        .route("/_ping", get(ping_handler))
        .route("/_debug", get(debug_handler))
        .route("/_stop", get(stop_handler));

    #[cfg(feature = "prometheus")]
    let router = router.route(
        "/metrics",
        get(crate::metrics_routes::prometheus_metrics_handler),
    );

    let router = router.layer(cors);

    #[cfg(feature = "metrics")]
    let router = router.layer(axum::middleware::from_fn(
        crate::metrics_middleware::http_metrics_middleware,
    ));

    router.with_state(state)
}

/// Start the render server and block until shutdown completes.
///
/// Shutdown is triggered by `GET /_stop` or SIGINT; either drains open
/// connections, evicts the session cache, and closes the browser before
/// this returns.
pub async fn start_server(config: PagecastConfig) -> anyhow::Result<()> {
    #[cfg(feature = "metrics")]
    let metrics_handle = if config.metrics.enabled {
        let recorder = pagecast_metrics::MetricsRecorderConfig {
            enabled: true,
            global_labels: Vec::new(),
        };
        match pagecast_metrics::init_metrics(recorder) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "metrics recorder failed to install, continuing without");
                None
            },
        }
    } else {
        None
    };

    let bind = &config.server.bind;
    let port = config.server.port;
    let own_host = format!("{bind}:{port}");

    let service = Arc::new(RenderService::new(&config, own_host.clone()));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let state = AppState {
        service: Arc::clone(&service),
        shutdown: shutdown_tx,
        #[cfg(feature = "metrics")]
        metrics_handle,
    };
    let app = build_app(state);

    let addr: SocketAddr = own_host.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = vec![
        format!("pagecast v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on http://{addr}"),
        format!(
            "renderer: {} sessions max, idle eviction after {}s",
            config.renderer.max_sessions, config.renderer.max_idle_secs
        ),
        format!(
            "browser: {}",
            config.renderer.chrome_binary.as_deref().unwrap_or("auto-detect")
        ),
        format!(
            "preflight: {}",
            if config.preflight.enabled { "on" } else { "off" }
        ),
    ];
    let width = lines.iter().map(String::len).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let stopped = async {
                // A closed channel means every sender is gone; treat it as stop.
                while !*shutdown_rx.borrow_and_update() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            tokio::select! {
                () = stopped => info!("stop requested, draining connections"),
                _ = tokio::signal::ctrl_c() => info!("interrupt received, draining connections"),
            }
        })
        .await?;

    service.shutdown().await;
    info!("pagecast stopped");
    Ok(())
}

// ── Render routes ────────────────────────────────────────────────────────────

async fn render_html_handler(
    State(state): State<AppState>,
    request: Result<Query<RenderRequest>, QueryRejection>,
) -> Response {
    render(state, RenderAction::Html, request).await
}

async fn render_har_handler(
    State(state): State<AppState>,
    request: Result<Query<RenderRequest>, QueryRejection>,
) -> Response {
    render(state, RenderAction::Har, request).await
}

async fn render_pdf_handler(
    State(state): State<AppState>,
    request: Result<Query<RenderRequest>, QueryRejection>,
) -> Response {
    render(state, RenderAction::Pdf, request).await
}

async fn render_png_handler(
    State(state): State<AppState>,
    request: Result<Query<RenderRequest>, QueryRejection>,
) -> Response {
    render(state, RenderAction::Png, request).await
}

async fn render_jpeg_handler(
    State(state): State<AppState>,
    request: Result<Query<RenderRequest>, QueryRejection>,
) -> Response {
    render(state, RenderAction::Jpeg, request).await
}

/// Run one render to completion on its own task.
///
/// A dropped connection cancels the handler future, not the spawned
/// pipeline, so the session release path always runs and no cache entry is
/// left active.
async fn render(
    state: AppState,
    action: RenderAction,
    extracted: Result<Query<RenderRequest>, QueryRejection>,
) -> Response {
    let request = match extracted {
        Ok(Query(request)) => request,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": rejection.body_text() })),
            )
                .into_response();
        },
    };

    let service = Arc::clone(&state.service);
    let task = tokio::spawn(async move { service.render(action, &request).await });

    match task.await {
        Ok(Ok(output)) => success_response(output),
        Ok(Err(err)) => error_response(&err),
        Err(err) => {
            error!(error = %err, action = %action, "render task aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "render task aborted" })),
            )
                .into_response()
        },
    }
}

fn success_response(output: RenderOutput) -> Response {
    match output.filename {
        Some(name) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, output.content_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("inline; filename=\"{name}\""),
                ),
            ],
            output.body,
        )
            .into_response(),
        None => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, output.content_type)],
            output.body,
        )
            .into_response(),
    }
}

fn error_response(err: &RenderError) -> Response {
    (
        status_for(err),
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Map a render failure to its HTTP status.
fn status_for(err: &RenderError) -> StatusCode {
    match err {
        RenderError::InvalidUrl(_)
        | RenderError::InvalidParams(_)
        | RenderError::NotHtml(_)
        | RenderError::RedirectLoop => StatusCode::BAD_REQUEST,
        RenderError::CacheFull(_) | RenderError::SessionBusy => StatusCode::TOO_MANY_REQUESTS,
        RenderError::NavigationTimedOut(_) | RenderError::CaptureTimedOut(_) => {
            StatusCode::REQUEST_TIMEOUT
        },
        RenderError::ChannelBroken(_) | RenderError::Automation(_) | RenderError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        },
    }
}

// ── Operational routes ───────────────────────────────────────────────────────

async fn ping_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn debug_handler(State(state): State<AppState>) -> Response {
    Json(state.service.debug_info().await).into_response()
}

async fn stop_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("shutdown requested over http");
    // Err means the serve loop already exited; nothing left to stop.
    let _ = state.shutdown.send(true);
    Json(serde_json::json!({ "status": "ok" }))
}
