//! HTTP surface for pagecast.
//!
//! One GET route per capture action (`/render_html`, `/render_har`,
//! `/render_pdf`, `/render_png`, `/render_jpeg`), all sharing the same
//! query parameters, plus a small operational surface: `/_ping` liveness,
//! `/_debug` cache and memory snapshot, `/_stop` graceful shutdown, and
//! `/metrics` when compiled with the `prometheus` feature.
//!
//! The router is built by [`build_app`] so tests can drive it over a real
//! socket; [`start_server`] owns the production lifecycle.

#[cfg(feature = "metrics")]
pub mod metrics_middleware;
#[cfg(feature = "prometheus")]
pub mod metrics_routes;
pub mod server;

pub use server::{AppState, build_app, start_server};
