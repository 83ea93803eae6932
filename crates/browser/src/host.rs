//! Shared browser process lifecycle.

use std::time::Duration;

use {
    chromiumoxide::{Browser, BrowserConfig as CdpBrowserConfig, Page, handler::viewport::Viewport},
    futures::StreamExt,
    tokio::{sync::Mutex, task::JoinHandle, time::timeout},
    tracing::{debug, info, warn},
};

use crate::{detect, error::RenderError, types::RenderConfig};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CDP_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Owns the single shared browser process. Launched lazily on first use and
/// relaunched when the control channel is broken; every session is a page
/// of this one browser.
pub struct BrowserHost {
    config: RenderConfig,
    browser: Mutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserHost {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            browser: Mutex::new(None),
            handler_task: Mutex::new(None),
        }
    }

    /// Open a fresh page on the shared browser, launching or relaunching
    /// it first when needed.
    pub async fn new_page(&self) -> Result<Page, RenderError> {
        let mut guard = self.browser.lock().await;
        self.ensure_locked(&mut guard).await?;
        let browser = guard
            .as_ref()
            .ok_or_else(|| RenderError::Automation("browser not available".to_string()))?;
        Ok(browser.new_page("about:blank").await?)
    }

    /// Force-close the shared browser so the next render relaunches it.
    /// Called only for failures classified as channel-broken; individual
    /// session failures never funnel here.
    pub async fn recycle(&self) {
        let mut guard = self.browser.lock().await;
        if guard.is_some() {
            warn!("recycling browser after broken channel");
            self.dispose_locked(&mut guard).await;

            #[cfg(feature = "metrics")]
            pagecast_metrics::counter!(pagecast_metrics::browser::RECYCLES_TOTAL).increment(1);
        }
    }

    /// Close the browser at service shutdown.
    pub async fn shutdown(&self) {
        let mut guard = self.browser.lock().await;
        if guard.is_some() {
            self.dispose_locked(&mut guard).await;
            info!("browser closed");
        }
    }

    /// Whether a browser process is currently live.
    pub async fn is_launched(&self) -> bool {
        self.browser.lock().await.is_some()
    }

    /// Version string for diagnostics; `None` when not launched or not
    /// responding.
    pub async fn probe_version(&self) -> Option<String> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref()?;
        match timeout(VERSION_PROBE_TIMEOUT, browser.version()).await {
            Ok(Ok(version)) => Some(version.product),
            _ => None,
        }
    }

    /// Health-probe the live browser (version query, short timeout) and
    /// relaunch when it is gone or unresponsive.
    async fn ensure_locked(&self, guard: &mut Option<Browser>) -> Result<(), RenderError> {
        if let Some(browser) = guard.as_ref() {
            match timeout(VERSION_PROBE_TIMEOUT, browser.version()).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => {
                    warn!(error = %err, "browser health probe failed, relaunching");
                },
                Err(_) => {
                    warn!("browser health probe timed out, relaunching");
                },
            }
            self.dispose_locked(guard).await;
        }

        *guard = Some(self.launch().await?);
        Ok(())
    }

    async fn launch(&self) -> Result<Browser, RenderError> {
        let binary = detect::find_browser(self.config.chrome_binary.as_deref())
            .ok_or_else(|| RenderError::Automation(detect::install_hint().to_string()))?;

        let mut builder = CdpBrowserConfig::builder()
            .chrome_executable(&binary)
            .viewport(Viewport {
                width: self.config.viewport_width,
                height: self.config.viewport_height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            // Outlasts the navigation budget so slow loads surface as our
            // own timeout instead of a CDP command failure.
            .request_timeout(self.config.navigation_timeout + CDP_TIMEOUT_MARGIN)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--mute-audio")
            .arg("--hide-scrollbars");

        if self.config.headful {
            builder = builder.with_head();
        }
        if self.config.ignore_https_errors {
            builder = builder.arg("--ignore-certificate-errors");
        }

        let cdp_config = builder.build().map_err(RenderError::Automation)?;

        let (browser, mut handler) = Browser::launch(cdp_config).await?;
        let task = tokio::spawn(async move {
            while let Some(_event) = handler.next().await {}
            debug!("cdp event handler exited");
        });
        *self.handler_task.lock().await = Some(task);

        info!(binary = %binary.display(), "browser launched");

        #[cfg(feature = "metrics")]
        pagecast_metrics::counter!(pagecast_metrics::browser::LAUNCHES_TOTAL).increment(1);

        Ok(browser)
    }

    /// Close the browser in `guard` and stop its handler task. Close runs
    /// first so the command can still reach the process.
    async fn dispose_locked(&self, guard: &mut Option<Browser>) {
        if let Some(mut browser) = guard.take() {
            if let Err(err) = browser.close().await {
                debug!(error = %err, "browser close failed");
            }
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_starts_without_a_browser() {
        let host = BrowserHost::new(RenderConfig::default());
        assert!(!host.is_launched().await);
        assert!(host.probe_version().await.is_none());
    }

    #[tokio::test]
    async fn recycle_and_shutdown_are_noops_when_not_launched() {
        let host = BrowserHost::new(RenderConfig::default());
        host.recycle().await;
        host.shutdown().await;
        assert!(!host.is_launched().await);
    }
}
