//! Seams to the collaborators a session serves.

use bytes::Bytes;
use tether_frame::Frame;

use crate::error::SessionError;

/// Receives inbound messages and connection events.
///
/// Called from the session's control and worker threads; implementations
/// must not block for long. To end the session from a callback, use
/// [`Session::request_stop`] or a [`StopHandle`]. [`Session::stop`] called
/// there only requests the stop and never joins.
///
/// [`Session::request_stop`]: crate::Session::request_stop
/// [`Session::stop`]: crate::Session::stop
/// [`StopHandle`]: crate::StopHandle
pub trait Dispatcher: Send + Sync {
    /// A complete inbound frame. Heartbeat acknowledgements are not delivered.
    fn on_message(&self, frame: &Frame);

    /// The session entered (`true`) or left (`false`) the connected state.
    fn on_connection_state_changed(&self, _connected: bool) {}

    /// A failure that ended a connection or a connection attempt.
    fn on_error(&self, _error: &SessionError) {}
}

/// Produces periodic system-information snapshots.
pub trait TelemetrySource: Send + Sync {
    /// Serialized snapshot ready to send, or `None` to skip this round.
    fn collect_snapshot(&self) -> Option<Bytes>;
}

/// Dispatcher that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn on_message(&self, _frame: &Frame) {}
}
