use std::time::Duration;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] tether_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] tether_frame::FrameError),

    /// The session is not in the connected state.
    #[error("not connected")]
    NotConnected,

    /// The operation needs a stopped session.
    #[error("session is running")]
    AlreadyRunning,

    /// A worker or control thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No inbound traffic within the liveness window.
    #[error("no heartbeat response for {0:?}")]
    HeartbeatTimeout(Duration),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// The peer broke the framing rules.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Frame(err) if err.is_protocol_violation())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
