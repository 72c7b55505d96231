use std::io::ErrorKind;
use std::net::SocketAddr;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The host name could not be resolved to a socket address.
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// Failed to connect to the resolved address (refused, timed out, unreachable).
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// A send or receive timed out. The operation may be retried.
    #[error("transport operation timed out")]
    Timeout,

    /// The connection was reset, aborted or otherwise lost.
    #[error("connection lost: {0}")]
    ConnectionLost(std::io::Error),

    /// The link was closed locally.
    #[error("link closed")]
    Closed,

    /// Discovery socket setup or broadcast failed.
    #[error("discovery failed: {0}")]
    Discovery(std::io::Error),

    /// Any other I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify a raw socket error from `send`/`recv`.
    pub fn from_stream_io(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Self::Timeout,
            // Reset, aborted, broken pipe and everything unexpected end the connection.
            _ => Self::ConnectionLost(err),
        }
    }

    /// Timeouts are silently retried; everything else ends the connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<TransportError> for std::io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => std::io::Error::from(ErrorKind::TimedOut),
            TransportError::Closed => {
                std::io::Error::new(ErrorKind::NotConnected, "link closed")
            }
            TransportError::ConnectionLost(source)
            | TransportError::Io(source)
            | TransportError::Discovery(source)
            | TransportError::Connect { source, .. } => source,
            other @ TransportError::Resolve { .. } => {
                std::io::Error::new(ErrorKind::NotFound, other.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
