//! Chromium binary discovery.

use std::path::PathBuf;

/// Known Chromium-based executable names, searched on PATH in order.
/// All of these speak CDP.
const CHROMIUM_EXECUTABLES: &[&str] = &[
    "chrome",
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "msedge",
    "microsoft-edge",
    "microsoft-edge-stable",
    "brave",
    "brave-browser",
];

/// macOS app bundle paths, checked before PATH because PATH can carry
/// broken wrapper scripts.
#[cfg(target_os = "macos")]
const MACOS_APP_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
    "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
];

/// Locate a Chromium-based browser binary.
///
/// Checks, in order: the configured path, the `CHROME` environment
/// variable, platform app bundles, then known executable names on PATH.
pub fn find_browser(configured: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = configured {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
        tracing::warn!(path, "configured chrome binary not found, falling back to discovery");
    }

    if let Ok(path) = std::env::var("CHROME") {
        let p = PathBuf::from(&path);
        if p.exists() {
            return Some(p);
        }
    }

    #[cfg(target_os = "macos")]
    for path in MACOS_APP_PATHS {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    CHROMIUM_EXECUTABLES
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// Install guidance for the launch error when no browser is found.
pub fn install_hint() -> &'static str {
    if cfg!(target_os = "macos") {
        "no chrome/chromium found; install one (brew install --cask google-chrome) \
         or set [renderer] chrome_binary or the CHROME environment variable"
    } else if cfg!(target_os = "windows") {
        "no chrome/chromium found; install one (winget install Google.Chrome) \
         or set [renderer] chrome_binary or the CHROME environment variable"
    } else {
        "no chrome/chromium found; install one (apt install chromium-browser, \
         dnf install chromium) or set [renderer] chrome_binary or the CHROME \
         environment variable"
    }
}
