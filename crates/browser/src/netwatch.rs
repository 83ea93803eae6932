//! Per-session network activity watch.
//!
//! Attached to every session before its first navigation. Keeps the
//! in-flight request gauge that quiescence waits poll, raises the
//! redirect-loop signal when a response points back at this service, and
//! records the traffic trace served by the har action.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    chromiumoxide::{
        Page,
        cdp::browser_protocol::network::{
            EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
            EventResponseReceived, Response, SetCacheDisabledParams,
        },
    },
    chrono::{DateTime, Utc},
    futures::StreamExt,
    tokio::{sync::watch, task::AbortHandle},
    tracing::{debug, warn},
};

use crate::error::RenderError;

/// One recorded network exchange. Redirect chains collapse into their
/// final hop.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub started: DateTime<Utc>,
    pub url: String,
    pub method: String,
    pub status: i64,
    pub status_text: String,
    pub mime_type: String,
    pub protocol: Option<String>,
    pub response_headers: Vec<(String, String)>,
    pub body_size: f64,
    pub finished: Option<DateTime<Utc>>,
}

impl TraceEntry {
    fn started_now(url: &str, method: &str) -> Self {
        Self {
            started: Utc::now(),
            url: url.to_string(),
            method: method.to_string(),
            status: 0,
            status_text: String::new(),
            mime_type: String::new(),
            protocol: None,
            response_headers: Vec::new(),
            body_size: 0.0,
            finished: None,
        }
    }
}

/// Point-in-time copy of a session's recorded traffic.
#[derive(Debug, Clone)]
pub struct TraceSnapshot {
    /// When recording started, before the first navigation.
    pub started: DateTime<Utc>,
    pub entries: Vec<TraceEntry>,
    /// Requests not recorded because the entry cap was reached.
    pub dropped: u64,
}

/// Bounded trace store, keyed by CDP request id.
struct Recorder {
    started: DateTime<Utc>,
    entries: Vec<TraceEntry>,
    index: HashMap<String, usize>,
    dropped: u64,
    cap: usize,
}

impl Recorder {
    fn new(cap: usize) -> Self {
        Self {
            started: Utc::now(),
            entries: Vec::new(),
            index: HashMap::new(),
            dropped: 0,
            cap,
        }
    }

    fn start(&mut self, id: &str, url: &str, method: &str) {
        if let Some(&i) = self.index.get(id) {
            // Redirect hop: same request id, new target.
            self.entries[i].url = url.to_string();
            return;
        }
        if self.entries.len() >= self.cap {
            self.dropped += 1;
            return;
        }
        self.index.insert(id.to_string(), self.entries.len());
        self.entries.push(TraceEntry::started_now(url, method));
    }

    fn response(&mut self, id: &str, response: &Response) {
        if let Some(&i) = self.index.get(id) {
            let entry = &mut self.entries[i];
            entry.status = response.status;
            entry.status_text = response.status_text.clone();
            entry.mime_type = response.mime_type.clone();
            entry.protocol = response.protocol.clone();
            entry.response_headers = flatten_headers(response.headers.inner());
        }
    }

    fn finish(&mut self, id: &str, encoded_len: f64) {
        if let Some(&i) = self.index.get(id) {
            let entry = &mut self.entries[i];
            entry.body_size = encoded_len;
            entry.finished = Some(Utc::now());
        }
    }

    fn fail(&mut self, id: &str, error_text: &str) {
        if let Some(&i) = self.index.get(id) {
            let entry = &mut self.entries[i];
            if entry.status == 0 {
                entry.status_text = error_text.to_string();
            }
            entry.finished = Some(Utc::now());
        }
    }

    fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            started: self.started,
            entries: self.entries.clone(),
            dropped: self.dropped,
        }
    }
}

struct Inner {
    key: String,
    own_host: String,
    live: Mutex<HashSet<String>>,
    recorder: Mutex<Recorder>,
    inflight_tx: watch::Sender<usize>,
    redirect_tx: watch::Sender<bool>,
}

impl Inner {
    fn on_request(&self, id: &str, url: &str, method: &str) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(id.to_string());
            self.inflight_tx.send_replace(live.len());
        }
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.start(id, url, method);
        }
    }

    fn on_response(&self, id: &str, response: &Response) {
        self.check_redirect(response);
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.response(id, response);
        }
    }

    fn on_finished(&self, id: &str, encoded_len: f64) {
        self.remove_live(id);
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.finish(id, encoded_len);
        }
    }

    fn on_failed(&self, id: &str, error_text: &str) {
        self.remove_live(id);
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.fail(id, error_text);
        }
    }

    fn remove_live(&self, id: &str) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(id);
            self.inflight_tx.send_replace(live.len());
        }
    }

    fn check_redirect(&self, response: &Response) {
        let Some(location) = redirect_location(response.status, response.headers.inner()) else {
            return;
        };
        if location.contains(self.own_host.as_str()) {
            warn!(key = %self.key, location, "redirect points back at this service");
            self.redirect_tx.send_replace(true);
        }
    }
}

/// Network watch handle held by the session.
pub struct NetWatch {
    inner: Arc<Inner>,
    inflight_rx: watch::Receiver<usize>,
    redirect_rx: watch::Receiver<bool>,
}

impl NetWatch {
    /// Wire the watch onto a page. Listeners register before
    /// `Network.enable` so nothing is missed, and the page cache is
    /// disabled so reuse still exercises the network.
    pub(crate) async fn attach(
        page: &Page,
        key: &str,
        har_cap: usize,
        own_host: &str,
    ) -> Result<(Self, Vec<AbortHandle>), RenderError> {
        let mut on_request = page.event_listener::<EventRequestWillBeSent>().await?;
        let mut on_response = page.event_listener::<EventResponseReceived>().await?;
        let mut on_finished = page.event_listener::<EventLoadingFinished>().await?;
        let mut on_failed = page.event_listener::<EventLoadingFailed>().await?;

        page.execute(EnableParams::builder().build()).await?;
        page.execute(SetCacheDisabledParams::new(true)).await?;

        let (inflight_tx, inflight_rx) = watch::channel(0usize);
        let (redirect_tx, redirect_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            key: key.to_string(),
            own_host: own_host.to_string(),
            live: Mutex::new(HashSet::new()),
            recorder: Mutex::new(Recorder::new(har_cap)),
            inflight_tx,
            redirect_tx,
        });

        let mut tasks = Vec::with_capacity(4);

        let watch = inner.clone();
        tasks.push(
            tokio::spawn(async move {
                while let Some(event) = on_request.next().await {
                    let id = event.request_id.inner().to_string();
                    if let Some(redirect) = &event.redirect_response {
                        watch.on_response(&id, redirect);
                    }
                    watch.on_request(&id, &event.request.url, &event.request.method);
                }
            })
            .abort_handle(),
        );

        let watch = inner.clone();
        tasks.push(
            tokio::spawn(async move {
                while let Some(event) = on_response.next().await {
                    let id = event.request_id.inner().to_string();
                    watch.on_response(&id, &event.response);
                }
            })
            .abort_handle(),
        );

        let watch = inner.clone();
        tasks.push(
            tokio::spawn(async move {
                while let Some(event) = on_finished.next().await {
                    let id = event.request_id.inner().to_string();
                    watch.on_finished(&id, event.encoded_data_length);
                }
            })
            .abort_handle(),
        );

        let watch = inner.clone();
        tasks.push(
            tokio::spawn(async move {
                while let Some(event) = on_failed.next().await {
                    let id = event.request_id.inner().to_string();
                    watch.on_failed(&id, &event.error_text);
                }
            })
            .abort_handle(),
        );

        debug!(key, "network watch attached");

        Ok((
            Self {
                inner,
                inflight_rx,
                redirect_rx,
            },
            tasks,
        ))
    }

    /// Resolve once at most `threshold` requests stay in flight for the
    /// whole settle window.
    pub async fn wait_quiescent(&self, threshold: usize, settle: Duration) {
        let mut rx = self.inflight_rx.clone();
        loop {
            if rx.wait_for(|n| *n <= threshold).await.is_err() {
                return;
            }
            match tokio::time::timeout(settle, rx.wait_for(|n| *n > threshold)).await {
                // Stayed at or under the threshold for the whole window.
                Err(_) => return,
                // Activity resumed; wait for it to drain again.
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return,
            }
        }
    }

    /// Resolve when a response redirects back at this service. Never
    /// resolves once the watch has shut down.
    pub async fn redirect_loop_detected(&self) {
        let mut rx = self.redirect_rx.clone();
        if rx.wait_for(|flag| *flag).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Requests currently in flight.
    pub fn inflight(&self) -> usize {
        *self.inflight_rx.borrow()
    }

    /// Copy of the traffic recorded so far.
    pub fn snapshot(&self) -> TraceSnapshot {
        match self.inner.recorder.lock() {
            Ok(recorder) => recorder.snapshot(),
            Err(_) => TraceSnapshot {
                started: Utc::now(),
                entries: Vec::new(),
                dropped: 0,
            },
        }
    }

    /// Watch with no page behind it, for cache tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (inflight_tx, inflight_rx) = watch::channel(0usize);
        let (redirect_tx, redirect_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                key: String::new(),
                own_host: String::new(),
                live: Mutex::new(HashSet::new()),
                recorder: Mutex::new(Recorder::new(16)),
                inflight_tx,
                redirect_tx,
            }),
            inflight_rx,
            redirect_rx,
        }
    }
}

/// Location header of a redirect response, when present.
fn redirect_location(status: i64, headers: &serde_json::Value) -> Option<&str> {
    if !(300..400).contains(&status) {
        return None;
    }
    headers.as_object()?.iter().find_map(|(name, value)| {
        name.eq_ignore_ascii_case("location")
            .then(|| value.as_str())
            .flatten()
    })
}

fn flatten_headers(headers: &serde_json::Value) -> Vec<(String, String)> {
    headers
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(name, value)| {
                    let value = value
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_string());
                    (name.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn quiescence_is_immediate_when_idle() {
        let watch = NetWatch::detached();
        timeout(
            Duration::from_secs(1),
            watch.wait_quiescent(2, Duration::from_millis(10)),
        )
        .await
        .expect("idle watch must be quiescent");
    }

    #[tokio::test(start_paused = true)]
    async fn quiescence_waits_until_under_threshold() {
        let watch = NetWatch::detached();
        watch.inner.on_request("r1", "https://a.test/1", "GET");
        watch.inner.on_request("r2", "https://a.test/2", "GET");
        watch.inner.on_request("r3", "https://a.test/3", "GET");
        assert_eq!(watch.inflight(), 3);

        let wait = watch.wait_quiescent(2, Duration::from_millis(500));
        tokio::pin!(wait);

        // Three in flight, threshold two: still pending after the window.
        assert!(timeout(Duration::from_secs(2), &mut wait).await.is_err());

        watch.inner.on_finished("r3", 100.0);
        timeout(Duration::from_secs(2), &mut wait)
            .await
            .expect("quiescent once under the threshold");
        assert_eq!(watch.inflight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_quiescence_needs_zero_inflight() {
        let watch = NetWatch::detached();
        watch.inner.on_request("r1", "https://a.test/1", "GET");

        let wait = watch.wait_quiescent(0, Duration::from_millis(500));
        tokio::pin!(wait);
        assert!(timeout(Duration::from_secs(2), &mut wait).await.is_err());

        watch.inner.on_failed("r1", "net::ERR_ABORTED");
        timeout(Duration::from_secs(2), &mut wait)
            .await
            .expect("quiescent at zero in flight");
    }

    #[tokio::test]
    async fn redirect_signal_resolves_waiters() {
        let watch = NetWatch::detached();
        watch.inner.redirect_tx.send_replace(true);
        timeout(Duration::from_millis(100), watch.redirect_loop_detected())
            .await
            .expect("signalled redirect must resolve");
    }

    #[test]
    fn redirect_location_needs_3xx_and_header() {
        let headers = json!({ "Location": "http://127.0.0.1:3000/render_html" });
        assert_eq!(
            redirect_location(302, &headers),
            Some("http://127.0.0.1:3000/render_html")
        );
        assert_eq!(redirect_location(200, &headers), None);

        let lower = json!({ "location": "https://elsewhere.test/" });
        assert_eq!(redirect_location(301, &lower), Some("https://elsewhere.test/"));

        assert_eq!(redirect_location(302, &json!({})), None);
    }

    #[test]
    fn recorder_caps_entries_and_counts_drops() {
        let mut recorder = Recorder::new(2);
        recorder.start("a", "https://a.test/", "GET");
        recorder.start("b", "https://b.test/", "GET");
        recorder.start("c", "https://c.test/", "GET");

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.dropped, 1);
    }

    #[test]
    fn recorder_collapses_redirect_hops() {
        let mut recorder = Recorder::new(16);
        recorder.start("a", "https://a.test/old", "GET");
        recorder.start("a", "https://a.test/new", "GET");
        recorder.finish("a", 512.0);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].url, "https://a.test/new");
        assert_eq!(snapshot.entries[0].body_size, 512.0);
        assert!(snapshot.entries[0].finished.is_some());
    }

    #[test]
    fn failed_requests_keep_the_error_text() {
        let mut recorder = Recorder::new(16);
        recorder.start("a", "https://a.test/", "GET");
        recorder.fail("a", "net::ERR_NAME_NOT_RESOLVED");

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.entries[0].status, 0);
        assert_eq!(snapshot.entries[0].status_text, "net::ERR_NAME_NOT_RESOLVED");
    }

    #[test]
    fn header_flattening_stringifies_values() {
        let flat = flatten_headers(&json!({ "content-type": "text/html", "x-count": 3 }));
        assert!(flat.contains(&("content-type".to_string(), "text/html".to_string())));
        assert!(flat.contains(&("x-count".to_string(), "3".to_string())));
    }
}
