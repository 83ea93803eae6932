//! Metric name and label definitions.
//!
//! All metric names used by the service live here so the exported surface
//! can be read in one place.

/// Render pipeline metrics
pub mod render {
    /// Total render requests by action
    pub const REQUESTS_TOTAL: &str = "pagecast_render_requests_total";
    /// End-to-end render duration in seconds
    pub const DURATION_SECONDS: &str = "pagecast_render_duration_seconds";
    /// Render failures by error kind
    pub const ERRORS_TOTAL: &str = "pagecast_render_errors_total";
    /// Navigation phase duration in seconds
    pub const NAVIGATION_DURATION_SECONDS: &str = "pagecast_render_navigation_duration_seconds";
    /// Capture phase duration in seconds
    pub const CAPTURE_DURATION_SECONDS: &str = "pagecast_render_capture_duration_seconds";
}

/// Session cache metrics
pub mod cache {
    /// Sessions currently held (active + idle)
    pub const SESSIONS: &str = "pagecast_cache_sessions";
    /// Total sessions admitted
    pub const SESSIONS_CREATED_TOTAL: &str = "pagecast_cache_sessions_created_total";
    /// Idle sessions reused without navigation
    pub const SESSIONS_REUSED_TOTAL: &str = "pagecast_cache_sessions_reused_total";
    /// Sessions removed by the idle sweep
    pub const SESSIONS_EVICTED_TOTAL: &str = "pagecast_cache_sessions_evicted_total";
    /// Admissions refused at capacity
    pub const FULL_TOTAL: &str = "pagecast_cache_full_total";
    /// Admissions refused because the URL was already active
    pub const BUSY_TOTAL: &str = "pagecast_cache_busy_total";
}

/// Request interception metrics
pub mod intercept {
    /// Requests allowed through
    pub const ALLOWED_TOTAL: &str = "pagecast_intercept_allowed_total";
    /// Requests aborted, by reason
    pub const ABORTED_TOTAL: &str = "pagecast_intercept_aborted_total";
}

/// Browser lifecycle metrics
pub mod browser {
    /// Browser processes launched
    pub const LAUNCHES_TOTAL: &str = "pagecast_browser_launches_total";
    /// Browser handle recycles after a broken channel
    pub const RECYCLES_TOTAL: &str = "pagecast_browser_recycles_total";
}

/// HTTP surface metrics
pub mod http {
    /// Total HTTP requests handled
    pub const REQUESTS_TOTAL: &str = "pagecast_http_requests_total";
    /// HTTP request duration in seconds
    pub const REQUEST_DURATION_SECONDS: &str = "pagecast_http_request_duration_seconds";
}

/// Common label keys
pub mod labels {
    pub const ACTION: &str = "action";
    pub const ENDPOINT: &str = "endpoint";
    pub const REASON: &str = "reason";
    pub const STATUS: &str = "status";
    pub const ERROR_TYPE: &str = "error_type";
}

/// Standard histogram buckets
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Render duration buckets (in seconds); navigation plus capture can
    /// run tens of seconds under the configured budgets.
    pub static RENDER_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0, 45.0, 60.0,
        ]
    });

    /// HTTP request duration buckets (in seconds)
    pub static HTTP_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ]
    });
}
