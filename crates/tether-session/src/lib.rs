//! Reconnecting client sessions over tether links.
//!
//! A [`Session`] keeps one controller connection alive: it connects,
//! optionally greets the controller, runs the send/receive/heartbeat workers,
//! and on any failure tears the connection down and retries after a fixed
//! delay until stopped or out of attempts.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod session;
pub mod state;
pub mod stats;
mod worker;

pub use config::SessionConfig;
pub use dispatch::{Dispatcher, NullDispatcher, TelemetrySource};
pub use error::{Result, SessionError};
pub use heartbeat::HeartbeatSequence;
pub use listener::{ClientConnection, ControllerListener};
pub use session::{Session, SessionBuilder, StopHandle};
pub use state::ConnectionState;
pub use stats::{Statistics, StatsSnapshot};
pub use worker::OutboundMessage;
