//! Configuration loading for pagecast.
//!
//! Config files: `pagecast.toml`, `pagecast.yaml`, or `pagecast.json`,
//! searched in `./` then `~/.config/pagecast/`.

pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, load_config},
    schema::{
        MetricsConfig, PagecastConfig, PreflightConfig, RendererConfig, ServerConfig,
        ViewportConfig,
    },
};
