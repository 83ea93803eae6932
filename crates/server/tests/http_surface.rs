//! End-to-end checks over a real socket.
//!
//! These spin up the full router on an ephemeral port and talk to it with
//! a plain HTTP client. No browser is launched: every request here either
//! hits the operational surface or fails validation before any session
//! work starts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use {
    pagecast_browser::RenderService,
    pagecast_config::PagecastConfig,
    pagecast_server::{AppState, build_app},
    std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::{net::TcpListener, sync::watch, task::JoinHandle},
};

async fn start_test_server() -> (SocketAddr, JoinHandle<()>) {
    start_test_server_with(PagecastConfig::default()).await
}

async fn start_test_server_with(config: PagecastConfig) -> (SocketAddr, JoinHandle<()>) {
    let service = Arc::new(RenderService::new(&config, "127.0.0.1:0"));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let state = AppState {
        service,
        shutdown: shutdown_tx,
        #[cfg(feature = "metrics")]
        metrics_handle: None,
    };
    let app = build_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
            .unwrap();
    });

    (addr, server)
}

#[tokio::test]
async fn ping_answers_ok() {
    let (addr, _server) = start_test_server().await;

    let resp = reqwest::get(format!("http://{addr}/_ping")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn debug_reports_an_unlaunched_browser() {
    let (addr, _server) = start_test_server().await;

    let resp = reqwest::get(format!("http://{addr}/_debug")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();

    assert_eq!(body["browser"]["launched"], false);
    assert_eq!(body["browser"]["version"], serde_json::Value::Null);
    assert_eq!(body["service"]["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["service"]["max_sessions"], 20);
    assert!(body["cache"].as_array().unwrap().is_empty());
    assert!(body["memory"]["total"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn bad_scheme_is_refused_before_any_session_work() {
    let (addr, _server) = start_test_server().await;

    let resp = reqwest::get(format!("http://{addr}/render_html?url=ftp://example.com/doc"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("invalid url"));

    // Nothing was admitted.
    let debug = reqwest::get(format!("http://{addr}/_debug")).await.unwrap();
    let debug: serde_json::Value = debug.json().await.unwrap();
    assert!(debug["cache"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn missing_url_is_a_bad_request() {
    let (addr, _server) = start_test_server().await;

    let resp = reqwest::get(format!("http://{addr}/render_png"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("url"));
}

#[tokio::test]
async fn cors_allows_any_origin() {
    let (addr, _server) = start_test_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/_ping"))
        .header("origin", "http://anywhere.example")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn preflight_refuses_targets_that_serve_images() {
    // A stand-in origin that answers every request as a PNG. The HEAD
    // preflight sees its content-type and refuses before any browser work.
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let png_app = axum::Router::new().route(
        "/",
        axum::routing::get(|| async {
            (
                [(axum::http::header::CONTENT_TYPE, "image/png")],
                vec![0x89u8, b'P', b'N', b'G'],
            )
        }),
    );
    tokio::spawn(async move {
        axum::serve(target, png_app).await.unwrap();
    });

    let (addr, _server) = start_test_server().await;

    let resp = reqwest::get(format!("http://{addr}/render_html?url=http://{target_addr}/"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("does not serve html"));
    assert!(message.contains("image/png"));
}

#[tokio::test]
async fn preflight_requests_the_target_url_verbatim() {
    // An origin that records every request line it sees and answers as
    // HTML. The canonical cache key strips the query string; the requests
    // the service sends out must not.
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let html_app = axum::Router::new().route(
        "/page",
        axum::routing::get(move |method: axum::http::Method, uri: axum::http::Uri| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().unwrap().push(format!("{method} {uri}"));
                (
                    [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    "<html><body>ok</body></html>",
                )
            }
        }),
    );
    tokio::spawn(async move {
        axum::serve(target, html_app).await.unwrap();
    });

    // Zero capacity refuses admission right after the preflight, so the
    // test never reaches for a browser.
    let mut config = PagecastConfig::default();
    config.renderer.max_sessions = 0;
    let (addr, _server) = start_test_server_with(config).await;

    let resp = reqwest::get(format!(
        "http://{addr}/render_html?url=http://{target_addr}/page?id=42"
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 429);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), ["HEAD /page?id=42"]);
}

#[tokio::test]
async fn stop_drains_the_server() {
    let (addr, server) = start_test_server().await;

    let resp = reqwest::get(format!("http://{addr}/_stop")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // The serve loop must exit on its own once connections drain.
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server should exit after /_stop")
        .unwrap();
}
