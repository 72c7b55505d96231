use std::io::ErrorKind;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The binary header carries a type tag this side does not know.
    #[error("unknown frame type {0}")]
    UnknownType(u32),

    /// A text record is not a JSON object.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A text payload contains the record delimiter.
    #[error("payload contains the newline delimiter")]
    EmbeddedDelimiter,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// Structured message (de)serialization failed.
    #[error("message json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// Timeouts leave buffered bytes intact; the read or write may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        )
    }

    /// The peer sent something that cannot be a valid record.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooLarge { .. } | Self::UnknownType(_) | Self::Malformed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
