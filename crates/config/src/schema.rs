//! Config schema types (server, renderer, preflight, metrics).

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PagecastConfig {
    pub server: ServerConfig,
    pub renderer: RendererConfig,
    pub preflight: PreflightConfig,
    pub metrics: MetricsConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    /// Port to listen on. Defaults to 3000.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

/// Viewport dimensions applied to every session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

/// Render pipeline configuration: session cache bounds, interception
/// budgets, navigation timing, and browser launch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Maximum live sessions held in the cache at once. Admissions beyond
    /// this are refused. Defaults to 20.
    pub max_sessions: usize,
    /// Interval between idle-eviction sweeps, in seconds. Defaults to 60.
    pub sweep_interval_secs: u64,
    /// Idle age at which a cached session is evicted, in seconds.
    /// Defaults to 60.
    pub max_idle_secs: u64,
    /// Budget for reaching network quiescence after navigation starts, in
    /// seconds. Defaults to 30.
    pub navigation_timeout_secs: u64,
    /// Network requests allowed per session before further requests are
    /// aborted. Defaults to 100.
    pub request_budget: u64,
    /// Seconds after navigation start past which all new requests are
    /// aborted. Defaults to 15.
    pub request_window_secs: u64,
    /// Window the in-flight count must stay at/below the threshold before
    /// the page counts as quiet, in milliseconds. Defaults to 500.
    pub settle_ms: u64,
    /// In-flight request threshold for quiescence. Image captures always
    /// use 0 regardless of this value. Defaults to 2.
    pub max_inflight: usize,
    /// Default viewport for new sessions.
    pub viewport: ViewportConfig,
    /// Path to a Chromium-based browser binary. When unset, the `CHROME`
    /// env var and well-known names on PATH are tried.
    pub chrome_binary: Option<String>,
    /// Launch with a visible window instead of headless.
    pub headful: bool,
    /// Ignore TLS certificate errors during navigation and preflight.
    /// Defaults to true.
    pub ignore_https_errors: bool,
    /// Host suffixes whose requests are aborted (trackers, ad networks).
    pub blocklist: Vec<String>,
    /// Upper bound on recorded network entries per session for HAR output.
    /// Defaults to 2000.
    pub har_max_entries: usize,
}

/// Tracker and ad hosts aborted by default. Suffix-matched against the
/// request host.
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    "doubleclick.net",
    "googleadservices.com",
    "googlesyndication.com",
    "google-analytics.com",
    "googletagmanager.com",
    "scorecardresearch.com",
    "quantserve.com",
    "adnxs.com",
    "taboola.com",
    "outbrain.com",
    "moatads.com",
    "hotjar.com",
];

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            sweep_interval_secs: 60,
            max_idle_secs: 60,
            navigation_timeout_secs: 30,
            request_budget: 100,
            request_window_secs: 15,
            settle_ms: 500,
            max_inflight: 2,
            viewport: ViewportConfig::default(),
            chrome_binary: None,
            headful: false,
            ignore_https_errors: true,
            blocklist: DEFAULT_BLOCKLIST.iter().map(|s| s.to_string()).collect(),
            har_max_entries: 2000,
        }
    }
}

/// HEAD preflight configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    /// Whether the content-type preflight runs before navigation.
    /// Defaults to true.
    pub enabled: bool,
    /// Preflight request timeout in seconds. Defaults to 5.
    pub timeout_secs: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 5,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metric recording is enabled. Defaults to false.
    pub enabled: bool,
}
