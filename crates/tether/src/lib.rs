//! Reconnecting TCP client sessions.
//!
//! tether keeps one long-lived connection to a controller: it resolves and
//! connects, frames messages as newline-delimited JSON or length-prefixed
//! binary, sends heartbeats, detects dead links and reconnects after a fixed
//! delay. Controllers can be found with a UDP broadcast.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP links, name resolution and UDP discovery
//! - [`frame`]: wire formats, frame reader/writer and structured messages
//! - [`session`]: the reconnecting session and a minimal controller (behind `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use tether_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tether_frame::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use tether_session::*;
}
