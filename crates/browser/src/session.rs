//! Page sessions: one browser page bound to a canonical URL.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    chromiumoxide::{Page, cdp::browser_protocol::network::DeleteCookiesParams},
    tokio::task::AbortHandle,
    tracing::debug,
};

use crate::{error::RenderError, intercept, netwatch::NetWatch, types::RenderConfig};

/// State shared between a session and its event-listener tasks.
pub struct SessionState {
    epoch: Instant,
    /// Millis after `epoch` at which the current navigation started.
    navigation_start_ms: AtomicU64,
    /// Counted (non-`data:`) requests over the session's lifetime.
    request_count: AtomicU64,
    /// Set when a capture completes; the interceptor then aborts all
    /// further requests.
    action_done: AtomicBool,
    viewport_width: AtomicU32,
    viewport_height: AtomicU32,
}

impl SessionState {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            navigation_start_ms: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            action_done: AtomicBool::new(false),
            viewport_width: AtomicU32::new(0),
            viewport_height: AtomicU32::new(0),
        }
    }

    /// Mark the start of a navigation. Re-arms interception by clearing
    /// the action-done flag and resetting the time window.
    pub fn mark_navigation(&self) {
        self.action_done.store(false, Ordering::SeqCst);
        self.navigation_start_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last navigation started.
    pub fn navigation_elapsed(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let start = self.navigation_start_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(start))
    }

    /// Count one intercepted request and return the running total.
    pub fn count_request(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Declare the capture finished so interception goes deny-all.
    pub fn finish_action(&self) {
        self.action_done.store(true, Ordering::SeqCst);
    }

    pub fn action_done(&self) -> bool {
        self.action_done.load(Ordering::SeqCst)
    }

    pub fn set_viewport(&self, width: u32, height: u32) {
        self.viewport_width.store(width, Ordering::Relaxed);
        self.viewport_height.store(height, Ordering::Relaxed);
    }

    pub fn viewport(&self) -> (u32, u32) {
        (
            self.viewport_width.load(Ordering::Relaxed),
            self.viewport_height.load(Ordering::Relaxed),
        )
    }
}

/// A live page session. Owned by the session cache; borrowed by one render
/// request at a time.
pub struct PageSession {
    key: String,
    created_at: Instant,
    page: Option<Page>,
    state: Arc<SessionState>,
    net: Arc<NetWatch>,
    /// Event-listener tasks, aborted on disposal.
    tasks: Vec<AbortHandle>,
    disposed: AtomicBool,
}

impl PageSession {
    /// Wire a session onto a fresh page. The network watch and the request
    /// interceptor attach before any navigation, so the recorded trace
    /// covers the whole session lifetime.
    pub async fn attach(
        page: Page,
        key: String,
        config: &RenderConfig,
        own_host: &str,
    ) -> Result<Self, RenderError> {
        let state = Arc::new(SessionState::new());

        let (net, mut tasks) =
            NetWatch::attach(&page, &key, config.har_max_entries, own_host).await?;
        let net = Arc::new(net);

        let intercept_task = intercept::attach(&page, &key, state.clone(), config).await?;
        tasks.push(intercept_task);

        Ok(Self {
            key,
            created_at: Instant::now(),
            page: Some(page),
            state,
            net,
            tasks,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn net(&self) -> &Arc<NetWatch> {
        &self.net
    }

    pub fn page(&self) -> Result<&Page, RenderError> {
        self.page
            .as_ref()
            .ok_or_else(|| RenderError::Automation("session has no page".to_string()))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tear the session down: stop the event tasks, clear the page's
    /// cookies, close the page. Runs exactly once; later calls are no-ops,
    /// and every step is best-effort.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in &self.tasks {
            task.abort();
        }

        if let Some(page) = &self.page {
            self.clear_cookies(page).await;
            if let Err(err) = page.clone().close().await {
                debug!(key = %self.key, error = %err, "page close failed");
            }
        }

        debug!(key = %self.key, requests = self.state.request_count(), "session disposed");
    }

    async fn clear_cookies(&self, page: &Page) {
        let cookies = match page.get_cookies().await {
            Ok(cookies) => cookies,
            Err(err) => {
                debug!(key = %self.key, error = %err, "cookie read failed");
                return;
            },
        };

        for cookie in cookies {
            let mut params = DeleteCookiesParams::new(cookie.name);
            params.domain = Some(cookie.domain);
            params.path = Some(cookie.path);
            if let Err(err) = page.execute(params).await {
                debug!(key = %self.key, error = %err, "cookie delete failed");
            }
        }
    }

    /// Session without a page or event tasks, for cache tests.
    #[cfg(test)]
    pub(crate) fn detached(key: &str) -> Self {
        Self {
            key: key.to_string(),
            created_at: Instant::now(),
            page: None,
            state: Arc::new(SessionState::new()),
            net: Arc::new(NetWatch::detached()),
            tasks: Vec::new(),
            disposed: AtomicBool::new(false),
        }
    }
}
