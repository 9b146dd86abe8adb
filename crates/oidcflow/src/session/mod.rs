//! Check-session polling.
//!
//! The authorization server exposes a hidden check-session frame. The
//! client posts `"{client_id} {session_state}"` to it and the frame answers
//! `unchanged`, `changed` or `error`. The frame itself belongs to the host
//! (a browser frame, a webview bridge, a test double); it is reached through
//! [`CheckSessionChannel`].

mod monitor;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

pub use monitor::{MAX_OUTSTANDING_MESSAGES, MonitorStats, SessionMonitor};

/// Identifies one loaded instance of the check-session frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

/// A message received through the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    /// Origin of the sender, e.g. `https://login.example.com`.
    pub origin: String,
    /// The frame that sent the message.
    pub source: FrameId,
    /// Message payload.
    pub data: String,
}

/// A freshly loaded check-session frame.
#[derive(Debug)]
pub struct OpenedFrame {
    /// Id the frame's replies carry as their `source`.
    pub id: FrameId,
    /// Messages delivered to the client window.
    pub messages: mpsc::UnboundedReceiver<FrameMessage>,
}

/// Errors raised by a check-session channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The frame could not be loaded.
    #[error("check session frame unavailable: {0}")]
    Unavailable(String),

    /// The channel was closed.
    #[error("check session channel closed")]
    Closed,

    /// A message could not be delivered.
    #[error("failed to post to check session frame: {0}")]
    Post(String),
}

/// The hidden-frame messaging primitive.
///
/// `open` is called again whenever the frame is reinitialized; the previous
/// receiver is dropped at that point.
#[async_trait]
pub trait CheckSessionChannel: Send + Sync {
    /// Loads the check-session frame.
    ///
    /// The returned stream may carry messages from other senders; only
    /// those whose `source` is the returned id come from this frame.
    async fn open(&self, url: &Url) -> Result<OpenedFrame, ChannelError>;

    /// Posts `message` to the frame, restricted to `target_origin`.
    fn post(&self, message: &str, target_origin: &str) -> Result<(), ChannelError>;

    /// Tears the frame down.
    fn close(&self);
}
