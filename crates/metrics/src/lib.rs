//! Metrics collection and export for pagecast.
//!
//! A thin layer over the `metrics` crate facade. When the `prometheus`
//! feature is enabled, metrics are exported in Prometheus text format via
//! the handle returned from [`init_metrics`].
//!
//! ```rust,ignore
//! use pagecast_metrics::{counter, histogram};
//!
//! counter!(pagecast_metrics::render::REQUESTS_TOTAL, "action" => "html").increment(1);
//! histogram!(pagecast_metrics::render::DURATION_SECONDS).record(0.42);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
