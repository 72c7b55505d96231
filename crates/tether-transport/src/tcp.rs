use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Connector, Link, LinkOptions};

/// Resolve `host` to a socket address.
///
/// Literal IPv4/IPv6 addresses skip the resolver entirely. For names, the
/// first IPv4 result is preferred.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    if host.is_empty() {
        return Err(TransportError::Resolve {
            host: host.to_string(),
            reason: "empty host".to_string(),
        });
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::Resolve {
            host: host.to_string(),
            reason: "no addresses returned".to_string(),
        })
}

/// A TCP connection owned exclusively by one session connection.
///
/// The socket is released when the last reference is dropped.
pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    closed: AtomicBool,
}

impl TcpLink {
    /// Connect to `addr` and apply `options`.
    pub fn connect(addr: SocketAddr, options: &LinkOptions) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, options.connect_timeout)
            .map_err(|source| TransportError::Connect { addr, source })?;
        Self::from_stream(stream, options)
    }

    /// Wrap an already connected stream (e.g. one returned by `accept`).
    pub fn from_stream(stream: TcpStream, options: &LinkOptions) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_read_timeout(non_zero(options.read_timeout))?;
        stream.set_write_timeout(non_zero(options.write_timeout))?;
        stream.set_nodelay(options.nodelay)?;
        if options.keepalive {
            set_keepalive(&stream);
        }
        let local = stream.local_addr().ok();

        Ok(Self {
            stream,
            peer,
            local,
            closed: AtomicBool::new(false),
        })
    }

    fn closed_or(&self, err: std::io::Error) -> TransportError {
        if self.is_closed() {
            TransportError::Closed
        } else {
            TransportError::from_stream_io(err)
        }
    }
}

impl Link for TcpLink {
    fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        (&self.stream).write(buf).map_err(|e| self.closed_or(e))
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match (&self.stream).read(buf) {
            Ok(0) if self.is_closed() => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(self.closed_or(e)),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Shutting down both halves wakes any thread blocked in send/recv.
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, error = %err, "shutdown on close failed");
        }
        debug!(peer = %self.peer, "tcp link closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Default [`Connector`]: resolves and connects over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u16, options: &LinkOptions) -> Result<Arc<dyn Link>> {
        let addr = resolve(host, port)?;
        info!(%addr, host, "connecting");
        let link = TcpLink::connect(addr, options)?;
        info!(%addr, local = ?link.local_addr(), "connected");
        Ok(Arc::new(link))
    }
}

/// Check whether something accepts TCP connections on `host:port`.
pub fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    match resolve(host, port) {
        Ok(addr) => TcpStream::connect_timeout(&addr, timeout).is_ok(),
        Err(err) => {
            debug!(host, error = %err, "probe resolution failed");
            false
        }
    }
}

fn non_zero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream) {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: `enable` is a valid readable c_int for the provided size, and the
    // descriptor is an open TCP socket owned by `stream`.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&enable as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!(error = %std::io::Error::last_os_error(), "failed to enable SO_KEEPALIVE");
    }
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream) {
    debug!("SO_KEEPALIVE not configured on this platform");
}
