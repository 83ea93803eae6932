//! Navigation coordination: viewport, redirect-loop race, quiescence,
//! media pause.

use {
    chromiumoxide::{
        Page,
        cdp::{
            browser_protocol::{
                emulation::SetDeviceMetricsOverrideParams,
                page::{CreateIsolatedWorldParams, FrameId, FrameTree, GetFrameTreeParams},
            },
            js_protocol::runtime::EvaluateParams,
        },
    },
    tokio::time::timeout,
    tracing::debug,
};

use crate::{error::RenderError, session::PageSession, types::RenderConfig};

/// Stops playback and buffering of media elements; run in every frame
/// after the page settles.
const PAUSE_MEDIA_JS: &str = r#"
document.querySelectorAll('video, audio').forEach((m) => {
  if (m.pause) m.pause();
  m.preload = 'none';
});
"#;

/// Drive a session to `url` and wait for the network to settle. The whole
/// sequence runs under the navigation budget; image captures pass
/// `strict` so the page goes fully idle before the shot.
pub async fn navigate(
    session: &PageSession,
    url: &str,
    width: u32,
    height: u32,
    strict: bool,
    config: &RenderConfig,
) -> Result<(), RenderError> {
    let budget = config.navigation_timeout;
    match timeout(budget, drive(session, url, width, height, strict, config)).await {
        Ok(result) => result,
        Err(_) => Err(RenderError::NavigationTimedOut(budget.as_secs())),
    }
}

async fn drive(
    session: &PageSession,
    url: &str,
    width: u32,
    height: u32,
    strict: bool,
    config: &RenderConfig,
) -> Result<(), RenderError> {
    let page = session.page()?;

    apply_viewport(page, width, height).await?;
    session.state().mark_navigation();

    let threshold = if strict { 0 } else { config.max_inflight };
    let load_and_settle = async {
        page.goto(url).await?;
        session.net().wait_quiescent(threshold, config.settle).await;
        Ok::<(), RenderError>(())
    };

    tokio::select! {
        // A response redirecting back at this service pre-empts the load.
        _ = session.net().redirect_loop_detected() => {
            return Err(RenderError::RedirectLoop);
        }
        result = load_and_settle => result?,
    }

    pause_media(page).await;

    // Re-apply in case the page resized itself during load.
    apply_viewport(page, width, height).await?;
    session.state().set_viewport(width, height);

    debug!(
        key = session.key(),
        width,
        height,
        strict,
        requests = session.state().request_count(),
        "navigation settled"
    );
    Ok(())
}

/// Apply the viewport via device metrics. Idempotent.
pub(crate) async fn apply_viewport(
    page: &Page,
    width: u32,
    height: u32,
) -> Result<(), RenderError> {
    let params = SetDeviceMetricsOverrideParams::builder()
        .width(width)
        .height(height)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(RenderError::Automation)?;
    page.execute(params).await?;
    Ok(())
}

/// Pause every `video`/`audio` element in every frame. Best-effort: a
/// frame that refuses an isolated world never fails the render.
async fn pause_media(page: &Page) {
    let tree = match page.execute(GetFrameTreeParams::default()).await {
        Ok(response) => response.result.frame_tree,
        Err(err) => {
            debug!(error = %err, "frame tree unavailable, skipping media pause");
            return;
        },
    };

    let mut frames = Vec::new();
    collect_frame_ids(&tree, &mut frames);

    for frame_id in frames {
        if let Err(err) = pause_media_in_frame(page, frame_id).await {
            debug!(error = %err, "media pause failed in frame");
        }
    }
}

fn collect_frame_ids(tree: &FrameTree, out: &mut Vec<FrameId>) {
    out.push(tree.frame.id.clone());
    if let Some(children) = &tree.child_frames {
        for child in children {
            collect_frame_ids(child, out);
        }
    }
}

async fn pause_media_in_frame(page: &Page, frame_id: FrameId) -> Result<(), RenderError> {
    let world = page
        .execute(CreateIsolatedWorldParams::new(frame_id))
        .await?;

    let eval = EvaluateParams::builder()
        .expression(PAUSE_MEDIA_JS)
        .context_id(world.result.execution_context_id.clone())
        .build()
        .map_err(RenderError::Automation)?;
    page.execute(eval).await?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn navigate_needs_a_live_page() {
        let session = PageSession::detached("https://example.com/");
        let err = navigate(
            &session,
            "https://example.com/",
            1024,
            768,
            false,
            &RenderConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RenderError::Automation(_)));
    }
}
