use std::fmt;
use std::io;

use tether_frame::FrameError;
use tether_session::SessionError;
use tether_transport::TransportError;

// Exit codes follow sysexits/coreutils conventions where one exists.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const CONFIG_INVALID: i32 = 78;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Timeout => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::Io(source) | TransportError::Discovery(source) => {
            io_error(context, source)
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. }
        | FrameError::EmbeddedDelimiter
        | FrameError::Malformed(_)
        | FrameError::UnknownType(_)
        | FrameError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Transport(err) => transport_error(context, err),
        SessionError::Frame(err) => frame_error(context, err),
        SessionError::InvalidConfig(_) => {
            CliError::new(CONFIG_INVALID, format!("{context}: {err}"))
        }
        SessionError::HeartbeatTimeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SessionError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        SessionError::NotConnected => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        SessionError::AlreadyRunning => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connect_maps_to_transport_error() {
        let err = TransportError::Connect {
            addr: "127.0.0.1:9".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(transport_error("connect", err).code, TRANSPORT_ERROR);
    }

    #[test]
    fn oversized_payload_is_invalid_data() {
        let err = SessionError::Frame(FrameError::PayloadTooLarge { size: 11, max: 10 });
        let cli = session_error("send", err);
        assert_eq!(cli.code, DATA_INVALID);
        assert!(cli.message.starts_with("send: "));
    }

    #[test]
    fn bad_config_has_its_own_code() {
        let err = SessionError::InvalidConfig("port must not be zero".into());
        assert_eq!(session_error("start", err).code, CONFIG_INVALID);
    }
}
