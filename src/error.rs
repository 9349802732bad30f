use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the bridge to the control thread.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Every port in the scan range was taken (or the bind budget ran out).
    #[error("no free port on {host} in range {start}-{end}")]
    BindExhausted { host: String, start: u16, end: u16 },
    /// The viewer went away while the session was live.
    #[error("viewer peer disconnected")]
    PeerDisconnected,
    /// A handshake or reply wait exceeded its bound.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },
    /// A joint control mode the integrator does not know.
    #[error("invalid control mode '{0}'")]
    InvalidControlMode(String),
    /// Misuse of the request/reply alternation.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Whether the error ends the whole session rather than a single call.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(self, BridgeError::Timeout { .. })
    }
}

impl From<webrtc::Error> for BridgeError {
    fn from(err: webrtc::Error) -> Self {
        BridgeError::Signaling(err.to_string())
    }
}
