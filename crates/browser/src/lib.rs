//! Browser-backed page rendering: session cache, request interception, and
//! capture actions over CDP.
//!
//! One shared Chromium process hosts every session. A session is a page
//! pinned to a canonical URL; the cache hands sessions out to render tasks
//! and parks them idle for reuse. While a session navigates, the
//! interceptor filters its network traffic against time, count, and
//! blocklist budgets.
//!
//! # Example
//!
//! ```ignore
//! use pagecast_browser::{RenderAction, RenderRequest, RenderService};
//!
//! let service = RenderService::new(&config, "localhost:3000");
//! let request = RenderRequest::for_url("https://example.com/");
//! let output = service.render(RenderAction::Html, &request).await?;
//! assert_eq!(output.content_type, "text/html; charset=utf-8");
//! ```

pub mod cache;
pub mod capture;
pub mod detect;
pub mod error;
pub mod har;
pub mod host;
mod intercept;
pub mod navigate;
pub mod netwatch;
pub mod service;
pub mod session;
pub mod types;

pub use {
    error::RenderError,
    service::{DebugInfo, RenderService},
    types::{RenderAction, RenderConfig, RenderOutput, RenderRequest},
};
