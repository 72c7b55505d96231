use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// A connected byte stream shared by the session's worker threads.
///
/// All methods take `&self`: one thread may block in [`Link::recv`] while
/// another sends, and any thread may call [`Link::close`] to unblock both.
pub trait Link: Send + Sync {
    /// Perform a single send call. Returns the number of bytes accepted.
    ///
    /// Timeouts surface as [`TransportError::Timeout`](crate::TransportError::Timeout)
    /// and may be retried; any other failure means the connection is lost.
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Perform a single blocking receive.
    ///
    /// `Ok(0)` means the peer closed the connection in an orderly way.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Close the link. Idempotent, callable from any thread.
    fn close(&self);

    /// Whether [`Link::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Remote address, when known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Local address, when known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Transport name for diagnostics.
    fn transport_name(&self) -> &'static str;
}

/// Socket options applied to every new link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// `SO_RCVTIMEO` equivalent. `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// `SO_SNDTIMEO` equivalent. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
    /// Enable `SO_KEEPALIVE`.
    pub keepalive: bool,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            keepalive: true,
            nodelay: true,
        }
    }
}

/// Creates links. This is the seam between the session core and the platform.
pub trait Connector: Send + Sync {
    /// Resolve `host` and open a new link to `host:port`.
    fn connect(&self, host: &str, port: u16, options: &LinkOptions) -> Result<Arc<dyn Link>>;
}

/// `Read`/`Write` adapter over a shared link, so frame readers and writers
/// can sit on top of any [`Link`].
#[derive(Clone)]
pub struct LinkIo {
    link: Arc<dyn Link>,
}

impl LinkIo {
    pub fn new(link: Arc<dyn Link>) -> Self {
        Self { link }
    }

    /// The shared link.
    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }
}

impl Read for LinkIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.link.recv(buf).map_err(Into::into)
    }
}

impl Write for LinkIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.link.send(buf).map_err(Into::into)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for LinkIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkIo")
            .field("transport", &self.link.transport_name())
            .field("peer", &self.link.peer_addr())
            .field("closed", &self.link.is_closed())
            .finish()
    }
}
