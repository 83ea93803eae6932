//! Capture dispatcher: turns a navigated session into response bytes.

use std::io::Cursor;

use {
    anyhow::Context,
    chromiumoxide::{
        cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams},
        page::ScreenshotParams,
    },
    image::{ImageFormat, ImageReader, imageops::FilterType},
    tokio::time::timeout,
    tracing::debug,
};

use crate::{
    error::RenderError,
    har,
    session::PageSession,
    types::{RenderAction, RenderOutput, RenderRequest},
};

/// Run one capture action against an already navigated session, bounded by
/// the action's own wall-clock budget. A timeout leaves the page in an
/// unknown state; callers dispose the session.
pub async fn capture(
    session: &PageSession,
    action: RenderAction,
    request: &RenderRequest,
) -> Result<RenderOutput, RenderError> {
    let budget = action.capture_timeout();
    let body = timeout(budget, produce(session, action, request))
        .await
        .map_err(|_| RenderError::CaptureTimedOut(budget.as_secs()))??;
    Ok(RenderOutput::new(action, body))
}

async fn produce(
    session: &PageSession,
    action: RenderAction,
    request: &RenderRequest,
) -> Result<Vec<u8>, RenderError> {
    match action {
        RenderAction::Html => {
            let markup = session.page()?.content().await?;
            Ok(markup.into_bytes())
        },
        RenderAction::Har => {
            // The recorder has been running since the session attached, so
            // the document covers every exchange, not just the last visit.
            let snapshot = session.net().snapshot();
            let document = har::build(session.key(), &snapshot);
            Ok(serde_json::to_vec(&document).context("serialize har document")?)
        },
        RenderAction::Pdf => print_pdf(session, request).await,
        RenderAction::Jpeg | RenderAction::Png => raster(session, action, request).await,
    }
}

async fn print_pdf(
    session: &PageSession,
    request: &RenderRequest,
) -> Result<Vec<u8>, RenderError> {
    let page = session.page()?;

    let mut params = PrintToPdfParams::builder();
    if let Some(name) = request.format.as_deref() {
        let (width, height) = paper_size(name)?;
        params = params.paper_width(width).paper_height(height);
    }
    if let Some(ranges) = request.page_ranges.as_deref() {
        params = params.page_ranges(ranges);
    }

    Ok(page.pdf(params.build()).await?)
}

async fn raster(
    session: &PageSession,
    action: RenderAction,
    request: &RenderRequest,
) -> Result<Vec<u8>, RenderError> {
    let page = session.page()?;
    let format = match action {
        RenderAction::Jpeg => CaptureScreenshotFormat::Jpeg,
        _ => CaptureScreenshotFormat::Png,
    };

    let mut clipped = None;
    if let Some(selector) = request.clip_selector.as_deref() {
        match page.find_element(selector).await {
            Ok(element) => clipped = Some(element.screenshot(format.clone()).await?),
            Err(err) => {
                debug!(selector, error = %err, "clip selector matched nothing, capturing viewport");
            },
        }
    }

    let bytes = match clipped {
        Some(bytes) => bytes,
        None => {
            page.screenshot(
                ScreenshotParams::builder()
                    .format(format)
                    .full_page(request.full_page)
                    .build(),
            )
            .await?
        },
    };

    match request.thumb_width {
        Some(thumb) if thumb < request.width => downsample(bytes, thumb, action),
        _ => Ok(bytes),
    }
}

/// Shrink a capture to `target_width`, keeping aspect ratio.
fn downsample(
    bytes: Vec<u8>,
    target_width: u32,
    action: RenderAction,
) -> Result<Vec<u8>, RenderError> {
    let decoded = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .context("sniff capture image format")?
        .decode()
        .context("decode capture for downsampling")?;

    if decoded.width() <= target_width {
        return Ok(bytes);
    }

    let scale = f64::from(target_width) / f64::from(decoded.width());
    let target_height = (f64::from(decoded.height()) * scale).round().max(1.0) as u32;
    let resized = decoded.resize(target_width, target_height, FilterType::Lanczos3);

    let format = match action {
        RenderAction::Jpeg => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    };
    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, format).context("encode thumbnail")?;
    Ok(out.into_inner())
}

/// Paper dimensions in inches for a named pdf format.
fn paper_size(name: &str) -> Result<(f64, f64), RenderError> {
    let size = match name.to_ascii_lowercase().as_str() {
        "letter" => (8.5, 11.0),
        "legal" => (8.5, 14.0),
        "tabloid" => (11.0, 17.0),
        "ledger" => (17.0, 11.0),
        "a0" => (33.1, 46.8),
        "a1" => (23.4, 33.1),
        "a2" => (16.54, 23.4),
        "a3" => (11.7, 16.54),
        "a4" => (8.27, 11.7),
        "a5" => (5.83, 8.27),
        "a6" => (4.13, 5.83),
        other => {
            return Err(RenderError::InvalidParams(format!(
                "unknown pdf format '{other}'"
            )));
        },
    };
    Ok(size)
}
