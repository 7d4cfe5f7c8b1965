//! Error taxonomy for live session operations.
//!
//! The transport reports failures as values, classified once here, so the
//! receive loop, keepalive loop, send path, and shutdown sequence all share a
//! single failure vocabulary instead of re-interpreting websocket errors at
//! every call site.

use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Failures surfaced by [`LiveClient`](crate::LiveClient) operations.
///
/// Callers that never enable a `termination_exception*` toggle only ever see
/// `Config` (from `new`/`start` preconditions); everything else is reported
/// as a boolean result plus a dispatched `Error` event.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Invalid options or client configuration. Raised synchronously, before
    /// any network activity.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The initial websocket connect failed.
    #[error("websocket connect failed: {0}")]
    Connect(#[source] Box<WsError>),
    /// The peer closed the connection with a non-normal status code.
    #[error("connection closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },
    /// A websocket protocol-level failure that is not a close.
    #[error("websocket transport error: {0}")]
    Transport(#[source] Box<WsError>),
    /// Anything else unexpected (e.g. a malformed inbound frame).
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl LiveError {
    /// Category label carried on dispatched error events.
    #[must_use]
    pub fn variant(&self) -> &'static str {
        match self {
            LiveError::Config(_) => "Configuration",
            LiveError::Connect(_) => "ConnectionError",
            LiveError::AbnormalClose { .. } => "ConnectionClosed",
            LiveError::Transport(_) => "WebSocketException",
            LiveError::Unexpected(_) => "Exception",
        }
    }
}

/// Classify a websocket stream error. `None` means clean termination — the
/// close handshake already completed and no event should fire.
pub(crate) fn classify_ws_error(error: WsError) -> Option<LiveError> {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => None,
        other => Some(LiveError::Transport(Box::new(other))),
    }
}

/// Classify a peer close frame. `None` means normal closure (code 1000 or an
/// empty close frame).
pub(crate) fn classify_close_frame(frame: Option<&CloseFrame>) -> Option<LiveError> {
    let Some(frame) = frame else {
        return None;
    };
    if frame.code == CloseCode::Normal {
        return None;
    }
    Some(LiveError::AbnormalClose {
        code: frame.code.into(),
        reason: frame.reason.to_string(),
    })
}
