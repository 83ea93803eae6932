//! Session cache keyed by canonical URL.
//!
//! At most one session exists per URL at any time. A session is either
//! checked out by exactly one render task or parked idle for reuse; a
//! background sweep disposes sessions that sit idle too long.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior},
    tracing::debug,
};

use crate::{error::RenderError, host::BrowserHost, session::PageSession, types::RenderConfig};

/// A session checked out of the cache. Every lease must come back through
/// [`SessionCache::release`], on failure paths included.
pub struct Lease {
    pub session: Arc<PageSession>,
    /// True when an idle session was handed out instead of a fresh page.
    pub reused: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("url", &self.session.key())
            .field("reused", &self.reused)
            .finish()
    }
}

enum Slot {
    /// Reserved while a new session is being opened, so concurrent
    /// admissions for the same URL lose instead of double-creating. The
    /// token ties the reservation to the admission call that placed it.
    Pending(u64),
    Active(Arc<PageSession>),
    Idle {
        session: Arc<PageSession>,
        since: Instant,
    },
}

/// One cache entry as shown by the debug endpoint.
#[derive(Debug, serde::Serialize)]
pub struct CacheEntryView {
    pub url: String,
    pub state: &'static str,
    pub age_secs: u64,
    pub requests: u64,
}

pub struct SessionCache {
    host: Arc<BrowserHost>,
    config: RenderConfig,
    own_host: String,
    slots: Mutex<HashMap<String, Slot>>,
    admissions: AtomicU64,
}

impl SessionCache {
    pub fn new(host: Arc<BrowserHost>, config: RenderConfig, own_host: impl Into<String>) -> Self {
        Self {
            host,
            config,
            own_host: own_host.into(),
            slots: Mutex::new(HashMap::new()),
            admissions: AtomicU64::new(0),
        }
    }

    /// Check a session out for `url`, opening a new page when none is
    /// cached. Refuses with `SessionBusy` when the URL is already checked
    /// out and `CacheFull` at capacity. The admission decision is atomic;
    /// the page open itself runs outside the lock under a `Pending` slot.
    pub async fn acquire(&self, url: &str) -> Result<Lease, RenderError> {
        let token = {
            let mut slots = self.slots.lock().await;

            if let Some(taken) = slots.remove(url) {
                return match taken {
                    Slot::Idle { session, .. } => {
                        slots.insert(url.to_string(), Slot::Active(Arc::clone(&session)));
                        debug!(url, "reusing idle session");
                        #[cfg(feature = "metrics")]
                        pagecast_metrics::counter!(pagecast_metrics::cache::SESSIONS_REUSED_TOTAL)
                            .increment(1);
                        Ok(Lease {
                            session,
                            reused: true,
                        })
                    },
                    taken => {
                        slots.insert(url.to_string(), taken);
                        #[cfg(feature = "metrics")]
                        pagecast_metrics::counter!(pagecast_metrics::cache::BUSY_TOTAL)
                            .increment(1);
                        Err(RenderError::SessionBusy)
                    },
                };
            }

            if slots.len() >= self.config.max_sessions {
                #[cfg(feature = "metrics")]
                pagecast_metrics::counter!(pagecast_metrics::cache::FULL_TOTAL).increment(1);
                return Err(RenderError::CacheFull(self.config.max_sessions));
            }

            let token = self.admissions.fetch_add(1, Ordering::Relaxed);
            slots.insert(url.to_string(), Slot::Pending(token));
            token
        };

        let opened = self.open_session(url).await.map(Arc::new);
        self.finish_admission(url, token, opened).await
    }

    /// Commit or roll back a `Pending` reservation once the page open
    /// resolves. `evict_all` can drain the reservation while the open is
    /// in flight and a later request can then re-admit the URL; a
    /// reservation this call no longer holds must not touch the newer
    /// entry.
    async fn finish_admission(
        &self,
        url: &str,
        token: u64,
        opened: Result<Arc<PageSession>, RenderError>,
    ) -> Result<Lease, RenderError> {
        match opened {
            Ok(session) => {
                let mut slots = self.slots.lock().await;
                let held = matches!(slots.get(url), Some(Slot::Pending(t)) if *t == token);
                if !held {
                    drop(slots);
                    debug!(url, "reservation revoked while opening, disposing session");
                    session.dispose().await;
                    return Err(RenderError::SessionBusy);
                }
                slots.insert(url.to_string(), Slot::Active(Arc::clone(&session)));
                #[cfg(feature = "metrics")]
                {
                    pagecast_metrics::counter!(pagecast_metrics::cache::SESSIONS_CREATED_TOTAL)
                        .increment(1);
                    pagecast_metrics::gauge!(pagecast_metrics::cache::SESSIONS)
                        .set(slots.len() as f64);
                }
                Ok(Lease {
                    session,
                    reused: false,
                })
            },
            Err(err) => {
                let mut slots = self.slots.lock().await;
                if matches!(slots.get(url), Some(Slot::Pending(t)) if *t == token) {
                    slots.remove(url);
                }
                Err(err)
            },
        }
    }

    async fn open_session(&self, url: &str) -> Result<PageSession, RenderError> {
        let page = self.host.new_page().await?;
        PageSession::attach(page, url.to_string(), &self.config, &self.own_host).await
    }

    /// Hand a leased session back. Success parks it idle for reuse;
    /// failure clears the slot and disposes the session.
    pub async fn release(&self, lease: Lease, success: bool) {
        let Lease { session, .. } = lease;
        let key = session.key().to_string();

        if success {
            let mut slots = self.slots.lock().await;
            let ours = match slots.get(&key) {
                None => true,
                Some(Slot::Active(current)) => Arc::ptr_eq(current, &session),
                Some(_) => false,
            };
            if ours {
                slots.insert(
                    key,
                    Slot::Idle {
                        session,
                        since: Instant::now(),
                    },
                );
                return;
            }
            drop(slots);
            // A newer session can own the slot after evict_all; never
            // overwrite it.
            debug!(url = %key, "slot taken on release, disposing session");
            session.dispose().await;
        } else {
            let mut slots = self.slots.lock().await;
            if let Some(Slot::Active(current)) = slots.get(&key) {
                if Arc::ptr_eq(current, &session) {
                    slots.remove(&key);
                }
            }
            #[cfg(feature = "metrics")]
            pagecast_metrics::gauge!(pagecast_metrics::cache::SESSIONS).set(slots.len() as f64);
            drop(slots);
            session.dispose().await;
        }
    }

    /// Dispose idle sessions at or past the idle age limit. Active and
    /// pending slots are left alone.
    pub async fn evict_expired(&self) {
        let mut expired = Vec::new();
        {
            let mut slots = self.slots.lock().await;
            slots.retain(|url, slot| match slot {
                Slot::Idle { session, since } if since.elapsed() >= self.config.max_idle => {
                    expired.push((url.clone(), Arc::clone(session)));
                    false
                },
                _ => true,
            });
            #[cfg(feature = "metrics")]
            pagecast_metrics::gauge!(pagecast_metrics::cache::SESSIONS).set(slots.len() as f64);
        }

        for (url, session) in expired {
            debug!(url = %url, "evicting idle session");
            session.dispose().await;
            #[cfg(feature = "metrics")]
            pagecast_metrics::counter!(pagecast_metrics::cache::SESSIONS_EVICTED_TOTAL)
                .increment(1);
        }
    }

    /// Dispose and drop every entry, active ones included. Shutdown path:
    /// in-flight renders fail against their closed pages and release into
    /// an empty map.
    pub async fn evict_all(&self) {
        let drained: Vec<(String, Slot)> = {
            let mut slots = self.slots.lock().await;
            let drained = slots.drain().collect();
            #[cfg(feature = "metrics")]
            pagecast_metrics::gauge!(pagecast_metrics::cache::SESSIONS).set(0.0);
            drained
        };

        for (url, slot) in drained {
            let session = match slot {
                Slot::Active(session) | Slot::Idle { session, .. } => session,
                Slot::Pending(_) => continue,
            };
            debug!(url = %url, "disposing cached session");
            session.dispose().await;
        }
    }

    /// Spawn the periodic idle sweep. The caller keeps the handle and
    /// aborts it on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first sweep waits a full period
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.evict_expired().await;
            }
        })
    }

    /// Read-only listing for the debug endpoint.
    pub async fn entries(&self) -> Vec<CacheEntryView> {
        let slots = self.slots.lock().await;
        let mut entries: Vec<CacheEntryView> = slots
            .iter()
            .map(|(url, slot)| {
                let (state, session) = match slot {
                    Slot::Pending(_) => ("pending", None),
                    Slot::Active(session) => ("active", Some(session)),
                    Slot::Idle { session, .. } => ("idle", Some(session)),
                };
                CacheEntryView {
                    url: url.clone(),
                    state,
                    age_secs: session
                        .map(|s| s.created_at().elapsed().as_secs())
                        .unwrap_or(0),
                    requests: session.map(|s| s.state().request_count()).unwrap_or(0),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        entries
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const URL: &str = "https://example.com/";

    fn cache_with(max_sessions: usize, max_idle: Duration) -> SessionCache {
        let config = RenderConfig {
            max_sessions,
            max_idle,
            ..RenderConfig::default()
        };
        let host = Arc::new(BrowserHost::new(config.clone()));
        SessionCache::new(host, config, "localhost:3000")
    }

    fn detached(url: &str) -> Arc<PageSession> {
        Arc::new(PageSession::detached(url))
    }

    async fn seed(cache: &SessionCache, url: &str, slot: Slot) {
        cache.slots.lock().await.insert(url.to_string(), slot);
    }

    async fn state_of(cache: &SessionCache, url: &str) -> Option<&'static str> {
        cache
            .entries()
            .await
            .into_iter()
            .find(|entry| entry.url == url)
            .map(|entry| entry.state)
    }

    #[tokio::test]
    async fn idle_sessions_are_reused_and_become_active() {
        let cache = cache_with(5, Duration::from_secs(60));
        seed(
            &cache,
            URL,
            Slot::Idle {
                session: detached(URL),
                since: Instant::now(),
            },
        )
        .await;

        let lease = cache.acquire(URL).await.unwrap();
        assert!(lease.reused);
        assert_eq!(state_of(&cache, URL).await, Some("active"));

        // the same URL is now checked out
        let err = cache.acquire(URL).await.unwrap_err();
        assert!(matches!(err, RenderError::SessionBusy));
    }

    #[tokio::test]
    async fn pending_slots_refuse_like_active_ones() {
        let cache = cache_with(5, Duration::from_secs(60));
        seed(&cache, URL, Slot::Pending(0)).await;

        let err = cache.acquire(URL).await.unwrap_err();
        assert!(matches!(err, RenderError::SessionBusy));
        assert_eq!(state_of(&cache, URL).await, Some("pending"));
    }

    #[tokio::test]
    async fn admission_at_capacity_refuses_without_creating() {
        let cache = cache_with(1, Duration::from_secs(60));
        seed(
            &cache,
            "https://other.example/",
            Slot::Idle {
                session: detached("https://other.example/"),
                since: Instant::now(),
            },
        )
        .await;

        let err = cache.acquire(URL).await.unwrap_err();
        assert!(matches!(err, RenderError::CacheFull(1)));
        assert_eq!(cache.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn successful_release_parks_the_session_idle() {
        let cache = cache_with(5, Duration::from_secs(60));
        let session = detached(URL);
        seed(&cache, URL, Slot::Active(Arc::clone(&session))).await;

        cache
            .release(
                Lease {
                    session: Arc::clone(&session),
                    reused: false,
                },
                true,
            )
            .await;

        assert_eq!(state_of(&cache, URL).await, Some("idle"));
        assert!(!session.is_disposed());
    }

    #[tokio::test]
    async fn successful_release_into_an_empty_slot_inserts_idle() {
        let cache = cache_with(5, Duration::from_secs(60));
        let session = detached(URL);

        cache
            .release(
                Lease {
                    session,
                    reused: false,
                },
                true,
            )
            .await;

        assert_eq!(state_of(&cache, URL).await, Some("idle"));
    }

    #[tokio::test]
    async fn successful_release_never_overwrites_a_newer_session() {
        let cache = cache_with(5, Duration::from_secs(60));
        let newer = detached(URL);
        seed(&cache, URL, Slot::Active(Arc::clone(&newer))).await;

        let stale = detached(URL);
        cache
            .release(
                Lease {
                    session: Arc::clone(&stale),
                    reused: false,
                },
                true,
            )
            .await;

        assert_eq!(state_of(&cache, URL).await, Some("active"));
        assert!(stale.is_disposed());
        assert!(!newer.is_disposed());
    }

    #[tokio::test]
    async fn failed_release_removes_and_disposes() {
        let cache = cache_with(5, Duration::from_secs(60));
        let session = detached(URL);
        seed(&cache, URL, Slot::Active(Arc::clone(&session))).await;

        cache
            .release(
                Lease {
                    session: Arc::clone(&session),
                    reused: false,
                },
                false,
            )
            .await;

        assert!(cache.entries().await.is_empty());
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_idle_sessions() {
        let cache = cache_with(5, Duration::ZERO);
        let idle = detached(URL);
        let active = detached("https://busy.example/");
        seed(
            &cache,
            URL,
            Slot::Idle {
                session: Arc::clone(&idle),
                since: Instant::now(),
            },
        )
        .await;
        seed(
            &cache,
            "https://busy.example/",
            Slot::Active(Arc::clone(&active)),
        )
        .await;

        cache.evict_expired().await;

        assert_eq!(state_of(&cache, URL).await, None);
        assert_eq!(state_of(&cache, "https://busy.example/").await, Some("active"));
        assert!(idle.is_disposed());
        assert!(!active.is_disposed());
    }

    #[tokio::test]
    async fn fresh_idle_sessions_survive_the_sweep() {
        let cache = cache_with(5, Duration::from_secs(60));
        seed(
            &cache,
            URL,
            Slot::Idle {
                session: detached(URL),
                since: Instant::now(),
            },
        )
        .await;

        cache.evict_expired().await;
        assert_eq!(state_of(&cache, URL).await, Some("idle"));
    }

    #[tokio::test]
    async fn evict_all_disposes_active_sessions_too() {
        let cache = cache_with(5, Duration::from_secs(60));
        let active = detached(URL);
        seed(&cache, URL, Slot::Active(Arc::clone(&active))).await;

        cache.evict_all().await;

        assert!(cache.entries().await.is_empty());
        assert!(active.is_disposed());
    }

    #[tokio::test]
    async fn racing_admissions_for_one_url_yield_a_single_lease() {
        let cache = Arc::new(cache_with(5, Duration::from_secs(60)));
        seed(
            &cache,
            URL,
            Slot::Idle {
                session: detached(URL),
                since: Instant::now(),
            },
        )
        .await;

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.acquire(URL).await })
            })
            .collect();

        let mut leases = Vec::new();
        let mut busy = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(lease) => leases.push(lease),
                Err(RenderError::SessionBusy) => busy += 1,
                Err(other) => panic!("unexpected admission error: {other}"),
            }
        }

        assert_eq!(leases.len(), 1);
        assert_eq!(busy, 7);
        assert_eq!(state_of(&cache, URL).await, Some("active"));
    }

    #[tokio::test]
    async fn capacity_twenty_admits_twenty_and_refuses_the_twenty_first() {
        let cache = Arc::new(cache_with(20, Duration::from_secs(60)));
        let urls: Vec<String> = (0..21)
            .map(|n| format!("https://site-{n}.example/"))
            .collect();
        for url in &urls[..20] {
            seed(
                &cache,
                url,
                Slot::Idle {
                    session: detached(url),
                    since: Instant::now(),
                },
            )
            .await;
        }

        let attempts: Vec<_> = urls
            .iter()
            .map(|url| {
                let cache = Arc::clone(&cache);
                let url = url.clone();
                tokio::spawn(async move { cache.acquire(&url).await })
            })
            .collect();

        let mut leases = 0;
        let mut full = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => leases += 1,
                Err(RenderError::CacheFull(20)) => full += 1,
                Err(other) => panic!("unexpected admission error: {other}"),
            }
        }

        assert_eq!(leases, 20);
        assert_eq!(full, 1);
    }

    #[tokio::test]
    async fn held_reservations_commit_to_active() {
        let cache = cache_with(5, Duration::from_secs(60));
        seed(&cache, URL, Slot::Pending(7)).await;

        let lease = cache
            .finish_admission(URL, 7, Ok(detached(URL)))
            .await
            .unwrap();

        assert!(!lease.reused);
        assert_eq!(state_of(&cache, URL).await, Some("active"));
    }

    #[tokio::test]
    async fn revoked_reservations_refuse_and_dispose_the_fresh_session() {
        let cache = cache_with(5, Duration::from_secs(60));

        // evict_all drained the reservation; the slot is gone
        let orphan = detached(URL);
        let err = cache
            .finish_admission(URL, 3, Ok(Arc::clone(&orphan)))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::SessionBusy));
        assert!(orphan.is_disposed());
        assert!(cache.entries().await.is_empty());

        // a later request re-admitted the URL meanwhile
        let newer = detached(URL);
        seed(&cache, URL, Slot::Active(Arc::clone(&newer))).await;
        let stale = detached(URL);
        let err = cache
            .finish_admission(URL, 4, Ok(Arc::clone(&stale)))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::SessionBusy));
        assert!(stale.is_disposed());
        assert!(!newer.is_disposed());
        assert_eq!(state_of(&cache, URL).await, Some("active"));
    }

    #[tokio::test]
    async fn failed_opens_clear_only_their_own_reservation() {
        let cache = cache_with(5, Duration::from_secs(60));
        seed(&cache, URL, Slot::Pending(11)).await;

        let err = cache
            .finish_admission(URL, 11, Err(RenderError::Automation("boom".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Automation(_)));
        assert!(cache.entries().await.is_empty());

        // a re-admitted slot is not this call's to clean up
        let newer = detached(URL);
        seed(&cache, URL, Slot::Active(Arc::clone(&newer))).await;
        let err = cache
            .finish_admission(URL, 12, Err(RenderError::Automation("boom".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Automation(_)));
        assert_eq!(state_of(&cache, URL).await, Some("active"));
        assert!(!newer.is_disposed());
    }
}
