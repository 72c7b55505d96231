use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tether_frame::{Envelope, Frame, FrameConfig, FrameReader, FrameWriter, Message};
use tether_transport::{Link, LinkIo, LinkOptions, TcpLink, TransportError};
use tracing::{debug, info};

use crate::error::Result;
use crate::heartbeat::ack_for;

/// Controller side of a tether link: accepts clients and answers heartbeats.
pub struct ControllerListener {
    listener: TcpListener,
    frame_config: FrameConfig,
    link_options: LinkOptions,
    responder_id: String,
    auto_ack: bool,
    next_peer_id: AtomicU64,
}

impl ControllerListener {
    /// Bind to a TCP address, e.g. `0.0.0.0:8080`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(TransportError::Io)?;
        info!(%addr, "controller listening");
        Ok(Self {
            listener,
            frame_config: FrameConfig::default(),
            link_options: LinkOptions {
                read_timeout: None,
                ..LinkOptions::default()
            },
            responder_id: "controller".to_string(),
            auto_ack: true,
            next_peer_id: AtomicU64::new(1),
        })
    }

    /// Codec and payload cap for accepted connections.
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    /// Socket options for accepted connections.
    pub fn with_link_options(mut self, options: LinkOptions) -> Self {
        self.link_options = options;
        self
    }

    /// Identifier stamped on acknowledgements.
    pub fn with_responder_id(mut self, id: impl Into<String>) -> Self {
        self.responder_id = id.into();
        self
    }

    /// Answer inbound heartbeats automatically. Default: on.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Accept next connection and assign an auto-generated client id.
    pub fn accept(&self) -> Result<ClientConnection> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Io)?;
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let link: Arc<dyn Link> = Arc::new(TcpLink::from_stream(stream, &self.link_options)?);
        info!(%peer, id, "client connected");

        Ok(ClientConnection {
            id: format!("client-{id}"),
            peer,
            reader: FrameReader::for_link(Arc::clone(&link), self.frame_config.clone()),
            writer: FrameWriter::for_link(Arc::clone(&link), self.frame_config.clone()),
            link,
            responder_id: self.responder_id.clone(),
            auto_ack: self.auto_ack,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(TransportError::Io)?)
    }
}

/// One accepted client.
pub struct ClientConnection {
    id: String,
    peer: SocketAddr,
    link: Arc<dyn Link>,
    reader: FrameReader<LinkIo>,
    writer: FrameWriter<LinkIo>,
    responder_id: String,
    auto_ack: bool,
}

impl ClientConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Next inbound frame. Heartbeats are acknowledged before being returned.
    pub fn recv(&mut self) -> Result<Frame> {
        let frame = self.reader.read_frame()?;
        if self.auto_ack {
            if let Some(ack) = ack_for(&frame, &self.responder_id)? {
                self.writer.write_frame(&ack)?;
                debug!(client = %self.id, "heartbeat acknowledged");
            }
        }
        Ok(frame)
    }

    pub fn send(&mut self, frame: &Frame) -> Result<usize> {
        Ok(self.writer.write_frame(frame)?)
    }

    /// Wrap `message` in an envelope and send it.
    pub fn send_message(&mut self, message: Message) -> Result<usize> {
        let frame = Envelope::new(&self.responder_id, message).into_frame()?;
        self.send(&frame)
    }

    /// Raw link, for tests that need to misbehave on the wire.
    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    pub fn close(&self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tether_frame::{FrameType, WireFormat};
    use tether_transport::{Connector, TcpConnector};

    use super::*;
    use crate::heartbeat::{heartbeat_frame, sequence_of};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("loopback address should parse")
    }

    #[test]
    fn accept_assigns_sequential_ids() {
        let listener = ControllerListener::bind(loopback()).expect("listener should bind");
        let port = listener.local_addr().expect("bound address").port();

        let clients = thread::spawn(move || {
            let first = TcpConnector
                .connect("127.0.0.1", port, &LinkOptions::default())
                .expect("first client should connect");
            let second = TcpConnector
                .connect("127.0.0.1", port, &LinkOptions::default())
                .expect("second client should connect");
            (first, second)
        });

        let first = listener.accept().expect("first accept should succeed");
        let second = listener.accept().expect("second accept should succeed");
        let _links = clients.join().expect("client thread should finish");

        assert_eq!(first.id(), "client-1");
        assert_eq!(second.id(), "client-2");
    }

    #[test]
    fn heartbeats_are_acknowledged() {
        let config = FrameConfig::default().with_wire_format(WireFormat::LengthPrefixed);
        let listener = ControllerListener::bind(loopback())
            .expect("listener should bind")
            .with_frame_config(config.clone());
        let port = listener.local_addr().expect("bound address").port();

        let server = thread::spawn(move || {
            let mut client = listener.accept().expect("listener should accept");
            let frame = client.recv().expect("should receive heartbeat");
            sequence_of(&frame)
        });

        let link = TcpConnector
            .connect("127.0.0.1", port, &LinkOptions::default())
            .expect("client should connect");
        let mut writer = FrameWriter::for_link(Arc::clone(&link), config.clone());
        let mut reader = FrameReader::for_link(link, config);

        writer
            .write_frame(&heartbeat_frame("agent", 1).expect("heartbeat frame"))
            .expect("heartbeat should send");
        let ack = reader.read_frame().expect("ack should arrive");

        assert_eq!(ack.kind, FrameType::HeartbeatAck);
        assert_eq!(server.join().expect("server thread should finish"), Some(1));
    }
}
