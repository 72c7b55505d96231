//! Network transport for tether sessions.
//!
//! Provides the byte-level layer the session core is built on:
//! - [`Link`]: a shared, closable byte stream with send/recv timeouts
//! - [`TcpConnector`] / [`TcpLink`]: the TCP implementation, including
//!   resolution, keepalive and `TCP_NODELAY`
//! - [`discovery`]: UDP broadcast discovery of controllers
//! - [`millis`]: serde helpers for millisecond durations
//!
//! This is the lowest layer of tether. Everything else builds on top of the
//! [`Link`] and [`Connector`] traits provided here.

pub mod discovery;
pub mod error;
pub mod millis;
pub mod tcp;
pub mod traits;

pub use discovery::{
    discover_servers, DiscoveredServer, DiscoveryConfig, DiscoveryResponder, DISCOVERY_ACK,
    DISCOVERY_REQUEST,
};
pub use error::{Result, TransportError};
pub use tcp::{probe, resolve, TcpConnector, TcpLink};
pub use traits::{Connector, Link, LinkIo, LinkOptions};
