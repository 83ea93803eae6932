//! Per-session network request interception.
//!
//! Every outbound request on a session pauses in the Fetch domain and is
//! either continued or aborted here. The decision itself is a pure function
//! so the budget boundaries stay testable without a browser.

use std::{sync::Arc, time::Duration};

use {
    chromiumoxide::{
        Page,
        cdp::browser_protocol::{
            fetch::{ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams},
            network::{ErrorReason, ResourceType},
        },
    },
    futures::StreamExt,
    tokio::task::AbortHandle,
    tracing::debug,
};

use crate::{
    error::RenderError,
    session::SessionState,
    types::{RenderConfig, is_host_blocked, truncate_url},
};

const LOG_URL_LEN: usize = 70;

/// Outcome for one paused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Continue,
    Abort(&'static str),
}

/// Interception policy, fixed per session at attach time.
#[derive(Debug, Clone)]
pub(crate) struct Policy {
    /// Elapsed time since navigation start after which everything aborts.
    pub window: Duration,
    /// Counted requests allowed; the request taking the count past this
    /// aborts.
    pub budget: u64,
    pub blocklist: Vec<String>,
}

impl Policy {
    fn from_config(config: &RenderConfig) -> Self {
        Self {
            window: config.request_window,
            budget: config.request_budget,
            blocklist: config.blocklist.clone(),
        }
    }
}

/// `data:` requests bypass interception accounting entirely.
pub(crate) fn is_data_uri(url: &str) -> bool {
    url.len() >= 5 && url[..5].eq_ignore_ascii_case("data:")
}

/// Decide one paused request. `count` is the running total of counted
/// requests, including this one.
pub(crate) fn decide(
    policy: &Policy,
    elapsed: Duration,
    count: u64,
    action_done: bool,
    url: &str,
    resource_type: &ResourceType,
) -> Decision {
    if is_data_uri(url) {
        return Decision::Continue;
    }
    if action_done {
        return Decision::Abort("action done");
    }
    if elapsed > policy.window {
        return Decision::Abort("time window");
    }
    if count > policy.budget {
        return Decision::Abort("request budget");
    }
    if is_host_blocked(url, &policy.blocklist) {
        return Decision::Abort("blocklist");
    }
    if matches!(resource_type, ResourceType::Manifest | ResourceType::Other) {
        return Decision::Abort("resource type");
    }
    Decision::Continue
}

/// Attach the interceptor to a page. The listener registers before
/// `Fetch.enable` so no request slips through unobserved.
pub(crate) async fn attach(
    page: &Page,
    key: &str,
    state: Arc<SessionState>,
    config: &RenderConfig,
) -> Result<AbortHandle, RenderError> {
    let mut events = page.event_listener::<EventRequestPaused>().await?;
    page.execute(EnableParams::builder().build()).await?;

    let policy = Policy::from_config(config);
    let page = page.clone();
    let key = key.to_string();

    let task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let url = event.request.url.as_str();
            let method = event.request.method.as_str();

            if is_data_uri(url) {
                let _ = page
                    .execute(ContinueRequestParams::new(event.request_id.clone()))
                    .await;
                continue;
            }

            let count = state.count_request();
            let decision = decide(
                &policy,
                state.navigation_elapsed(),
                count,
                state.action_done(),
                url,
                &event.resource_type,
            );

            match decision {
                Decision::Continue => {
                    debug!(
                        key,
                        method,
                        url = %truncate_url(url, LOG_URL_LEN),
                        count,
                        "request allowed"
                    );

                    #[cfg(feature = "metrics")]
                    pagecast_metrics::counter!(pagecast_metrics::intercept::ALLOWED_TOTAL)
                        .increment(1);

                    let _ = page
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await;
                },
                Decision::Abort(reason) => {
                    debug!(
                        key,
                        method,
                        url = %truncate_url(url, LOG_URL_LEN),
                        reason,
                        "request aborted"
                    );

                    #[cfg(feature = "metrics")]
                    pagecast_metrics::counter!(
                        pagecast_metrics::intercept::ABORTED_TOTAL,
                        pagecast_metrics::labels::REASON => reason
                    )
                    .increment(1);

                    let _ = page
                        .execute(FailRequestParams::new(
                            event.request_id.clone(),
                            ErrorReason::BlockedByClient,
                        ))
                        .await;
                },
            }
        }
        debug!(key, "interceptor exited");
    });

    Ok(task.abort_handle())
}
