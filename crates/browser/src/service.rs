//! Render coordinator: the full pipeline from a validated URL to response
//! bytes, with session admission and guaranteed release on every path.

use std::{sync::Arc, time::Duration};

use {
    serde::Serialize,
    tokio::task::JoinHandle,
    tracing::{debug, info, warn},
};

use pagecast_config::{PagecastConfig, PreflightConfig};

use crate::{
    cache::{CacheEntryView, Lease, SessionCache},
    capture,
    error::RenderError,
    host::BrowserHost,
    navigate,
    types::{RenderAction, RenderConfig, RenderOutput, RenderRequest, canonicalize_url},
};

#[cfg(feature = "metrics")]
use std::time::Instant;

/// Drives the whole render pipeline. One instance per process, shared
/// across requests.
pub struct RenderService {
    config: RenderConfig,
    host: Arc<BrowserHost>,
    cache: Arc<SessionCache>,
    preflight: Option<reqwest::Client>,
    sweeper: JoinHandle<()>,
}

impl RenderService {
    /// Build the service and start the idle sweep. `own_host` is the
    /// host:port this service is reachable on, used to detect pages that
    /// redirect back into the service.
    pub fn new(config: &PagecastConfig, own_host: impl Into<String>) -> Self {
        let render_config = RenderConfig::from(&config.renderer);
        let host = Arc::new(BrowserHost::new(render_config.clone()));
        let cache = Arc::new(SessionCache::new(
            Arc::clone(&host),
            render_config.clone(),
            own_host,
        ));
        let sweeper = cache.spawn_sweeper();
        let preflight = preflight_client(&config.preflight, render_config.ignore_https_errors);

        Self {
            config: render_config,
            host,
            cache,
            preflight,
            sweeper,
        }
    }

    /// Render one request end to end: canonicalize, preflight, admit,
    /// navigate, capture. The canonical form is only the admission key;
    /// preflight and navigation hit the exact URL the caller sent, query
    /// string included. Success parks the session for reuse; any failure
    /// after admission disposes it, and a broken control channel also
    /// recycles the shared browser.
    pub async fn render(
        &self,
        action: RenderAction,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        let canonical = canonicalize_url(&request.url)?;
        let target = request.url.as_str();
        self.preflight(target).await?;

        #[cfg(feature = "metrics")]
        let started = Instant::now();
        #[cfg(feature = "metrics")]
        pagecast_metrics::counter!(
            pagecast_metrics::render::REQUESTS_TOTAL,
            pagecast_metrics::labels::ACTION => action.as_str()
        )
        .increment(1);

        let lease = match self.cache.acquire(&canonical).await {
            Ok(lease) => lease,
            Err(err) => {
                self.note_failure(&err, target);
                return Err(err);
            },
        };

        match self.drive(&lease, action, request, target).await {
            Ok(output) => {
                // From here the session is parked; the interceptor aborts
                // any traffic the idle page still generates.
                lease.session.state().finish_action();
                self.cache.release(lease, true).await;
                info!(
                    url = %target,
                    action = %action,
                    bytes = output.body.len(),
                    "render complete"
                );
                #[cfg(feature = "metrics")]
                pagecast_metrics::histogram!(
                    pagecast_metrics::render::DURATION_SECONDS,
                    pagecast_metrics::labels::ACTION => action.as_str()
                )
                .record(started.elapsed().as_secs_f64());
                Ok(output)
            },
            Err(err) => {
                let broken = err.is_channel_broken();
                self.cache.release(lease, false).await;
                if broken {
                    self.host.recycle().await;
                }
                self.note_failure(&err, target);
                Err(err)
            },
        }
    }

    async fn drive(
        &self,
        lease: &Lease,
        action: RenderAction,
        request: &RenderRequest,
        target: &str,
    ) -> Result<RenderOutput, RenderError> {
        let session = &lease.session;

        if lease.reused && !request.fresh {
            // Keep the loaded document; just size the viewport for this
            // capture. The action-done flag stays set, so nothing the page
            // does in the background gets through.
            debug!(url = %target, "serving from cached session");
            navigate::apply_viewport(session.page()?, request.width, request.height).await?;
            session.state().set_viewport(request.width, request.height);
        } else {
            #[cfg(feature = "metrics")]
            let nav_started = Instant::now();
            navigate::navigate(
                session,
                target,
                request.width,
                request.height,
                action.wants_strict_quiescence(),
                &self.config,
            )
            .await?;
            #[cfg(feature = "metrics")]
            pagecast_metrics::histogram!(pagecast_metrics::render::NAVIGATION_DURATION_SECONDS)
                .record(nav_started.elapsed().as_secs_f64());
        }

        #[cfg(feature = "metrics")]
        let capture_started = Instant::now();
        let output = capture::capture(session, action, request).await?;
        #[cfg(feature = "metrics")]
        pagecast_metrics::histogram!(pagecast_metrics::render::CAPTURE_DURATION_SECONDS)
            .record(capture_started.elapsed().as_secs_f64());
        Ok(output)
    }

    /// HEAD the target and refuse URLs that declare a non-HTML
    /// content-type. Transport failures are ignored; navigation will
    /// surface the real error with better context.
    async fn preflight(&self, url: &str) -> Result<(), RenderError> {
        let Some(client) = &self.preflight else {
            return Ok(());
        };

        match client.head(url).send().await {
            Ok(response) => {
                let Some(value) = response.headers().get(reqwest::header::CONTENT_TYPE) else {
                    return Ok(());
                };
                let content_type = value.to_str().unwrap_or_default();
                if content_type.is_empty() || is_html_content_type(content_type) {
                    Ok(())
                } else {
                    Err(RenderError::NotHtml(content_type.to_string()))
                }
            },
            Err(err) => {
                debug!(url, error = %err, "preflight failed, continuing to navigation");
                Ok(())
            },
        }
    }

    fn note_failure(&self, err: &RenderError, url: &str) {
        warn!(url, error = %err, kind = err.kind(), "render failed");
        #[cfg(feature = "metrics")]
        pagecast_metrics::counter!(
            pagecast_metrics::render::ERRORS_TOTAL,
            pagecast_metrics::labels::ERROR_TYPE => err.kind()
        )
        .increment(1);
    }

    /// Point-in-time operational snapshot for the debug endpoint.
    pub async fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            service: ServiceInfo {
                version: env!("CARGO_PKG_VERSION"),
                max_sessions: self.config.max_sessions,
            },
            browser: BrowserInfo {
                launched: self.host.is_launched().await,
                version: self.host.probe_version().await,
            },
            cache: self.cache.entries().await,
            memory: MemoryInfo::collect(),
        }
    }

    /// Tear everything down: stop the sweep, dispose every session, close
    /// the browser. Called on shutdown.
    pub async fn shutdown(&self) {
        self.sweeper.abort();
        self.cache.evict_all().await;
        self.host.shutdown().await;
        info!("render service stopped");
    }
}

fn preflight_client(
    config: &PreflightConfig,
    accept_invalid_certs: bool,
) -> Option<reqwest::Client> {
    if !config.enabled {
        return None;
    }
    let built = reqwest::Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .timeout(Duration::from_secs(config.timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build();
    match built {
        Ok(client) => Some(client),
        Err(err) => {
            warn!(error = %err, "preflight client unavailable, check disabled");
            None
        },
    }
}

fn is_html_content_type(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    lowered.contains("text/html") || lowered.contains("application/xhtml")
}

/// Operational snapshot served by the debug endpoint.
#[derive(Debug, Serialize)]
pub struct DebugInfo {
    pub service: ServiceInfo,
    pub browser: BrowserInfo,
    pub cache: Vec<CacheEntryView>,
    pub memory: MemoryInfo,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub version: &'static str,
    pub max_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct BrowserInfo {
    pub launched: bool,
    pub version: Option<String>,
}

/// Process RSS plus system memory, in bytes.
#[derive(Debug, Serialize)]
pub struct MemoryInfo {
    pub process: u64,
    pub available: u64,
    pub total: u64,
}

impl MemoryInfo {
    fn collect() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let pid = sysinfo::get_current_pid().ok();
        if let Some(pid) = pid {
            sys.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::Some(&[pid]),
                false,
                sysinfo::ProcessRefreshKind::nothing().with_memory(),
            );
        }
        let process = pid
            .and_then(|p| sys.process(p))
            .map(|p| p.memory())
            .unwrap_or(0);
        let total = sys.total_memory();
        // available_memory() returns 0 on macOS; fall back to total − used.
        let available = match sys.available_memory() {
            0 => total.saturating_sub(sys.used_memory()),
            v => v,
        };
        Self {
            process,
            available,
            total,
        }
    }
}
