//! UDP broadcast discovery.
//!
//! A client broadcasts [`DISCOVERY_REQUEST`] on the discovery port and
//! collects every source address that answers with [`DISCOVERY_ACK`] before
//! the timeout expires. With no answers the result falls back to localhost,
//! so callers always get at least one candidate.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Request token sent in the broadcast datagram.
pub const DISCOVERY_REQUEST: &str = "REMOTE_ACTIVITY_DISCOVERY";
/// Token a controller must include in its answer.
pub const DISCOVERY_ACK: &str = "REMOTE_ACTIVITY_SERVER";
/// Well-known discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5555;
/// Address used when nobody answers.
pub const FALLBACK_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const MAX_DATAGRAM: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A controller that answered a discovery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredServer {
    pub address: IpAddr,
}

/// Discovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Port the request is broadcast to.
    pub port: u16,
    /// Destination of the request. Normally the limited broadcast address.
    pub broadcast_addr: IpAddr,
    /// How long to collect answers.
    #[serde(rename = "timeout_ms", with = "crate::millis")]
    pub timeout: Duration,
    /// Shuffle the candidates to spread clients across controllers.
    pub shuffle: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            timeout: Duration::from_secs(5),
            shuffle: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_broadcast_addr(mut self, addr: IpAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }
}

/// Run one discovery round.
///
/// Never returns an empty list: without answers the result is
/// `[FALLBACK_ADDRESS]`.
pub fn discover_servers(config: &DiscoveryConfig) -> Result<Vec<DiscoveredServer>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(TransportError::Discovery)?;
    socket
        .set_broadcast(true)
        .map_err(TransportError::Discovery)?;

    let target = SocketAddr::new(config.broadcast_addr, config.port);
    socket
        .send_to(DISCOVERY_REQUEST.as_bytes(), target)
        .map_err(TransportError::Discovery)?;
    info!(%target, timeout = ?config.timeout, "discovery broadcast sent");

    let mut servers = collect_answers(&socket, config.timeout)?;

    if servers.is_empty() {
        info!(fallback = %FALLBACK_ADDRESS, "no controllers answered discovery");
        servers.push(DiscoveredServer {
            address: FALLBACK_ADDRESS,
        });
    } else if config.shuffle {
        servers.shuffle(&mut rand::thread_rng());
    }

    Ok(servers)
}

fn collect_answers(socket: &UdpSocket, timeout: Duration) -> Result<Vec<DiscoveredServer>> {
    let deadline = Instant::now() + timeout;
    let mut servers: Vec<DiscoveredServer> = Vec::new();
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        socket
            .set_read_timeout(Some(remaining.min(POLL_INTERVAL)))
            .map_err(TransportError::Discovery)?;

        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            // Some platforms surface ICMP port-unreachable for an earlier datagram here.
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionReset
                ) =>
            {
                continue
            }
            Err(err) => return Err(TransportError::Discovery(err)),
        };

        let answer = String::from_utf8_lossy(&buf[..len]);
        if !answer.contains(DISCOVERY_ACK) {
            debug!(%from, "ignoring unrelated datagram");
            continue;
        }

        let server = DiscoveredServer {
            address: from.ip(),
        };
        if !servers.contains(&server) {
            info!(address = %server.address, "discovered controller");
            servers.push(server);
        }
    }

    Ok(servers)
}

/// Controller side of discovery: answers every request with [`DISCOVERY_ACK`].
pub struct DiscoveryResponder {
    socket: UdpSocket,
}

impl DiscoveryResponder {
    /// Bind the responder socket, e.g. `0.0.0.0:5555`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(TransportError::Discovery)?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(TransportError::Discovery)?;
        info!(%addr, "discovery responder listening");
        Ok(Self { socket })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Discovery)
    }

    /// Answer requests until `running` is cleared. Returns the number answered.
    pub fn run(&self, running: &AtomicBool) -> Result<usize> {
        let mut answered = 0usize;
        while running.load(Ordering::SeqCst) {
            if self.answer_one()?.is_some() {
                answered = answered.saturating_add(1);
            }
        }
        Ok(answered)
    }

    /// Wait one poll interval for a request and answer it.
    pub fn answer_one(&self) -> Result<Option<SocketAddr>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                return Ok(None)
            }
            Err(err) => return Err(TransportError::Discovery(err)),
        };

        if !String::from_utf8_lossy(&buf[..len]).contains(DISCOVERY_REQUEST) {
            return Ok(None);
        }

        if let Err(err) = self.socket.send_to(DISCOVERY_ACK.as_bytes(), from) {
            warn!(%from, error = %err, "failed to answer discovery request");
            return Ok(None);
        }
        debug!(%from, "answered discovery request");
        Ok(Some(from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_responders_falls_back_to_localhost() {
        // Nothing listens on the port of a socket we bind and immediately drop.
        let port = {
            let scratch = UdpSocket::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };
        let config = DiscoveryConfig::default()
            .with_port(port)
            .with_broadcast_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_timeout(Duration::from_millis(200));

        let servers = discover_servers(&config).unwrap();
        assert_eq!(
            servers,
            vec![DiscoveredServer {
                address: "127.0.0.1".parse().unwrap()
            }]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn responder_is_discovered_once() {
        let responder = DiscoveryResponder::bind("127.0.0.2:0".parse().unwrap()).unwrap();
        let port = responder.local_addr().unwrap().port();

        let running = std::sync::Arc::new(AtomicBool::new(true));
        let handle = {
            let running = std::sync::Arc::clone(&running);
            std::thread::spawn(move || responder.run(&running).unwrap())
        };

        let config = DiscoveryConfig::default()
            .with_port(port)
            .with_broadcast_addr("127.0.0.2".parse().unwrap())
            .with_timeout(Duration::from_millis(600));
        let servers = discover_servers(&config).unwrap();

        running.store(false, Ordering::SeqCst);
        let answered = handle.join().unwrap();

        assert_eq!(answered, 1);
        assert_eq!(
            servers,
            vec![DiscoveredServer {
                address: "127.0.0.2".parse().unwrap()
            }]
        );
    }

    #[test]
    fn duplicate_answers_are_deduplicated() {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client_addr = client.local_addr().unwrap();

        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.send_to(DISCOVERY_ACK.as_bytes(), client_addr).unwrap();
        server.send_to(b"noise", client_addr).unwrap();
        server.send_to(DISCOVERY_ACK.as_bytes(), client_addr).unwrap();

        let servers = collect_answers(&client, Duration::from_millis(300)).unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].address.is_loopback());
    }

    #[test]
    fn responder_ignores_unrelated_requests() {
        let responder = DiscoveryResponder::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = responder.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"hello", target).unwrap();
        assert!(responder.answer_one().unwrap().is_none());

        client.send_to(DISCOVERY_REQUEST.as_bytes(), target).unwrap();
        let answered = responder.answer_one().unwrap();
        assert_eq!(answered, Some(client.local_addr().unwrap()));
    }

    #[test]
    fn config_uses_millisecond_fields() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"port": 6000, "timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert!(!config.shuffle);
    }
}
