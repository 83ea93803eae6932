//! Render request/response types and URL helpers.

use std::{fmt, time::Duration};

use serde::Deserialize;

use crate::error::RenderError;

/// Capture action for a render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderAction {
    Html,
    Har,
    Pdf,
    Jpeg,
    Png,
}

impl RenderAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Har => "har",
            Self::Pdf => "pdf",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }

    /// Response content type for this action.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Html => "text/html; charset=utf-8",
            Self::Har => "application/json",
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// Inline download filename, for actions that serve one.
    pub fn filename(self) -> Option<&'static str> {
        match self {
            Self::Pdf => Some("pagecast.pdf"),
            _ => None,
        }
    }

    /// Wall-clock budget for the capture itself, separate from the
    /// navigation budget.
    pub fn capture_timeout(self) -> Duration {
        match self {
            Self::Html | Self::Har | Self::Pdf => Duration::from_secs(10),
            Self::Jpeg | Self::Png => Duration::from_secs(20),
        }
    }

    /// Image captures wait for the network to go fully idle; everything
    /// else tolerates a couple of stragglers.
    pub fn wants_strict_quiescence(self) -> bool {
        matches!(self, Self::Jpeg | Self::Png)
    }
}

impl fmt::Display for RenderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query parameters accepted by every render route.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    /// Target page URL.
    pub url: String,

    /// Viewport width in CSS pixels.
    #[serde(default = "default_viewport_width")]
    pub width: u32,

    /// Viewport height in CSS pixels.
    #[serde(default = "default_viewport_height")]
    pub height: u32,

    /// Paper format name for pdf captures (letter, a4, ...).
    #[serde(default)]
    pub format: Option<String>,

    /// Page ranges for pdf captures, e.g. "1-3,5".
    #[serde(default)]
    pub page_ranges: Option<String>,

    /// Downsample image captures to this width, preserving aspect ratio.
    #[serde(default)]
    pub thumb_width: Option<u32>,

    /// Capture the full scroll height instead of the viewport.
    #[serde(default)]
    pub full_page: bool,

    /// Capture the first element matching this CSS selector instead of the
    /// whole page.
    #[serde(default)]
    pub clip_selector: Option<String>,

    /// Re-navigate even when an idle session for this url is cached.
    #[serde(default)]
    pub fresh: bool,
}

fn default_viewport_width() -> u32 {
    1024
}

fn default_viewport_height() -> u32 {
    768
}

impl RenderRequest {
    /// Minimal request for a URL, everything else at defaults.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            width: default_viewport_width(),
            height: default_viewport_height(),
            format: None,
            page_ranges: None,
            thumb_width: None,
            full_page: false,
            clip_selector: None,
            fresh: false,
        }
    }
}

/// A completed capture: body bytes plus how they should be served.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    /// Inline Content-Disposition filename, when the action sets one.
    pub filename: Option<&'static str>,
}

impl RenderOutput {
    pub fn new(action: RenderAction, body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: action.content_type(),
            filename: action.filename(),
        }
    }
}

/// Runtime renderer configuration, converted from the file schema.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Path to the Chrome/Chromium binary (auto-detected if not set).
    pub chrome_binary: Option<String>,
    /// Run with a visible browser window.
    pub headful: bool,
    /// Proceed past TLS certificate errors.
    pub ignore_https_errors: bool,
    /// Browser window width at launch.
    pub viewport_width: u32,
    /// Browser window height at launch.
    pub viewport_height: u32,
    /// Maximum live sessions in the cache.
    pub max_sessions: usize,
    /// Idle age at which a cached session is evicted.
    pub max_idle: Duration,
    /// Interval between eviction sweeps.
    pub sweep_interval: Duration,
    /// Budget for navigation plus network quiescence.
    pub navigation_timeout: Duration,
    /// Counted requests allowed per session before interception aborts.
    pub request_budget: u64,
    /// Elapsed time since navigation start after which interception aborts.
    pub request_window: Duration,
    /// How long the in-flight count must hold under the threshold to count
    /// as quiescent.
    pub settle: Duration,
    /// In-flight request threshold for lenient quiescence.
    pub max_inflight: usize,
    /// Host suffixes whose requests are aborted.
    pub blocklist: Vec<String>,
    /// Cap on recorded network trace entries per session.
    pub har_max_entries: usize,
}

impl From<&pagecast_config::RendererConfig> for RenderConfig {
    fn from(cfg: &pagecast_config::RendererConfig) -> Self {
        Self {
            chrome_binary: cfg.chrome_binary.clone(),
            headful: cfg.headful,
            ignore_https_errors: cfg.ignore_https_errors,
            viewport_width: cfg.viewport.width,
            viewport_height: cfg.viewport.height,
            max_sessions: cfg.max_sessions,
            max_idle: Duration::from_secs(cfg.max_idle_secs),
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
            navigation_timeout: Duration::from_secs(cfg.navigation_timeout_secs),
            request_budget: cfg.request_budget,
            request_window: Duration::from_secs(cfg.request_window_secs),
            settle: Duration::from_millis(cfg.settle_ms),
            max_inflight: cfg.max_inflight,
            blocklist: cfg.blocklist.clone(),
            har_max_entries: cfg.har_max_entries,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::from(&pagecast_config::RendererConfig::default())
    }
}

/// Canonical cache key for a target URL: scheme + host + path, query and
/// fragment stripped. Rejects anything that is not http(s).
pub fn canonicalize_url(raw: &str) -> Result<String, RenderError> {
    let mut parsed =
        url::Url::parse(raw).map_err(|err| RenderError::InvalidUrl(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RenderError::InvalidUrl(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.into())
}

/// Check whether a request URL's host matches the blocklist.
/// An entry matches the host itself and any subdomain of it.
pub fn is_host_blocked(url: &str, blocklist: &[String]) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };

    blocklist.iter().any(|entry| {
        host == entry.as_str()
            || host
                .strip_suffix(entry.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Shorten a URL for log lines.
pub(crate) fn truncate_url(url: &str, max: usize) -> String {
    if url.len() <= max {
        return url.to_string();
    }
    let mut end = max;
    while !url.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &url[..end])
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_strips_query_and_fragment() {
        let key = canonicalize_url("https://example.com/a/b?x=1&y=2#frag").unwrap();
        assert_eq!(key, "https://example.com/a/b");
    }

    #[test]
    fn canonical_url_keeps_path_and_normalizes_root() {
        let key = canonicalize_url("http://example.com").unwrap();
        assert_eq!(key, "http://example.com/");
    }

    #[test]
    fn canonical_url_rejects_non_http_schemes() {
        assert!(canonicalize_url("ftp://example.com/file").is_err());
        assert!(canonicalize_url("file:///etc/passwd").is_err());
        assert!(canonicalize_url("data:text/html,hi").is_err());
    }

    #[test]
    fn canonical_url_rejects_garbage() {
        assert!(canonicalize_url("not a url").is_err());
        assert!(canonicalize_url("").is_err());
    }

    #[test]
    fn blocklist_matches_domain_and_subdomains() {
        let blocklist = vec!["doubleclick.net".to_string()];
        assert!(is_host_blocked("https://doubleclick.net/ad", &blocklist));
        assert!(is_host_blocked("https://stats.g.doubleclick.net/x", &blocklist));
        assert!(!is_host_blocked("https://notdoubleclick.net/x", &blocklist));
        assert!(!is_host_blocked("https://example.com/", &blocklist));
    }

    #[test]
    fn blocklist_ignores_unparseable_urls() {
        let blocklist = vec!["doubleclick.net".to_string()];
        assert!(!is_host_blocked("::::", &blocklist));
    }

    #[test]
    fn truncate_url_shortens_long_urls() {
        let long = "https://example.com/".to_string() + &"x".repeat(100);
        let short = truncate_url(&long, 70);
        assert_eq!(short.chars().count(), 71); // 70 chars plus the ellipsis
        assert!(short.ends_with('…'));

        assert_eq!(truncate_url("https://example.com/", 70), "https://example.com/");
    }

    #[test]
    fn request_defaults_from_query_json() {
        let req: RenderRequest =
            serde_json::from_value(serde_json::json!({ "url": "https://example.com" })).unwrap();
        assert_eq!(req.width, 1024);
        assert_eq!(req.height, 768);
        assert!(!req.full_page);
        assert!(!req.fresh);
        assert!(req.thumb_width.is_none());

        let req: RenderRequest = serde_json::from_value(serde_json::json!({
            "url": "https://example.com",
            "thumbWidth": 320,
            "fullPage": true,
            "clipSelector": "#main",
            "pageRanges": "1-2",
        }))
        .unwrap();
        assert_eq!(req.thumb_width, Some(320));
        assert!(req.full_page);
        assert_eq!(req.clip_selector.as_deref(), Some("#main"));
        assert_eq!(req.page_ranges.as_deref(), Some("1-2"));
    }

    #[test]
    fn action_capture_budgets() {
        assert_eq!(RenderAction::Html.capture_timeout(), Duration::from_secs(10));
        assert_eq!(RenderAction::Png.capture_timeout(), Duration::from_secs(20));
        assert!(RenderAction::Png.wants_strict_quiescence());
        assert!(!RenderAction::Har.wants_strict_quiescence());
        assert_eq!(RenderAction::Pdf.filename(), Some("pagecast.pdf"));
        assert_eq!(RenderAction::Html.filename(), None);
    }
}
