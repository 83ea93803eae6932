//! Render error types.

use thiserror::Error;

/// Errors that can occur while rendering a page.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid parameter: {0}")]
    InvalidParams(String),

    #[error("url does not serve html (content-type: {0})")]
    NotHtml(String),

    #[error("session cache full: {0} live sessions")]
    CacheFull(usize),

    #[error("a render for this url is already in progress")]
    SessionBusy,

    #[error("redirect loop detected")]
    RedirectLoop,

    #[error("navigation timed out after {0}s")]
    NavigationTimedOut(u64),

    #[error("capture timed out after {0}s")]
    CaptureTimedOut(u64),

    #[error("browser channel broken: {0}")]
    ChannelBroken(String),

    #[error("automation error: {0}")]
    Automation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RenderError {
    /// Whether this failure means the shared browser handle is unusable and
    /// must be relaunched before the next render.
    pub fn is_channel_broken(&self) -> bool {
        match self {
            Self::ChannelBroken(_) => true,
            Self::Automation(msg) => is_broken_channel_message(msg),
            _ => false,
        }
    }

    /// Stable short name for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "invalid_url",
            Self::InvalidParams(_) => "invalid_params",
            Self::NotHtml(_) => "not_html",
            Self::CacheFull(_) => "cache_full",
            Self::SessionBusy => "session_busy",
            Self::RedirectLoop => "redirect_loop",
            Self::NavigationTimedOut(_) => "navigation_timeout",
            Self::CaptureTimedOut(_) => "capture_timeout",
            Self::ChannelBroken(_) => "channel_broken",
            Self::Automation(_) => "automation",
            Self::Other(_) => "other",
        }
    }
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        let msg = err.to_string();
        if is_broken_channel_message(&msg) {
            RenderError::ChannelBroken(msg)
        } else {
            RenderError::Automation(msg)
        }
    }
}

/// Error text from the automation layer that indicates the control channel
/// to the browser process is gone (process died or the websocket dropped).
pub(crate) fn is_broken_channel_message(msg: &str) -> bool {
    if msg.contains("AlreadyClosed")
        || msg.contains("ConnectionClosed")
        || msg.contains("ChannelSendError")
    {
        return true;
    }
    let lower = msg.to_lowercase();
    lower.contains("connection closed") || lower.contains("browser closed")
}
