use std::io::{ErrorKind, Read};
use std::sync::Arc;

use bytes::BytesMut;
use tether_transport::{Link, LinkIo};

use crate::codec::{decode_length_prefixed, decode_line_from, Frame, FrameConfig, WireFormat};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
/// A read timeout is returned as a retryable error and the bytes buffered so
/// far are kept for the next call.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    chunk: Vec<u8>,
    /// Leading bytes of `buf` already searched for a line delimiter.
    scanned: usize,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            chunk: vec![0u8; config.read_chunk_size.max(1)],
            scanned: 0,
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decode_buffered()? {
                return Ok(frame);
            }

            let read = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&self.chunk[..read]);
        }
    }

    fn decode_buffered(&mut self) -> Result<Option<Frame>> {
        let max = self.config.max_payload_size;
        match self.config.wire_format {
            WireFormat::LengthPrefixed => decode_length_prefixed(&mut self.buf, max),
            WireFormat::LineDelimited => decode_line_from(&mut self.buf, max, &mut self.scanned),
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<LinkIo> {
    /// Create a frame reader over a shared link.
    pub fn for_link(link: Arc<dyn Link>, config: FrameConfig) -> Self {
        Self::with_config(LinkIo::new(link), config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, Bytes};

    use super::*;
    use crate::codec::encode_frame;
    use crate::kind::FrameType;

    fn binary_config() -> FrameConfig {
        FrameConfig::default().with_wire_format(WireFormat::LengthPrefixed)
    }

    fn wire(format: WireFormat, frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            encode_frame(format, frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_binary_frame() {
        let bytes = wire(
            WireFormat::LengthPrefixed,
            &[Frame::new(FrameType::Command, "hello")],
        );
        let mut reader = FrameReader::with_config(Cursor::new(bytes), binary_config());
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, FrameType::Command);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_lines() {
        let frames = [
            Frame::new(FrameType::Heartbeat, "{\"type\":\"heartbeat\",\"sequence\":1}"),
            Frame::new(FrameType::Command, "{\"type\":\"command\"}"),
            Frame::new(FrameType::Response, "{\"type\":\"command_response\"}"),
        ];
        let bytes = wire(WireFormat::LineDelimited, &frames);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        for expected in &frames {
            assert_eq!(&reader.read_frame().unwrap(), expected);
        }
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn read_frame_larger_than_chunk() {
        let payload = vec![0xAB; 64 * 1024];
        let bytes = wire(
            WireFormat::LengthPrefixed,
            &[Frame::new(FrameType::Telemetry, payload.clone())],
        );
        let mut reader = FrameReader::with_config(Cursor::new(bytes), binary_config());
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn frame_split_across_two_reads() {
        let bytes = wire(
            WireFormat::LengthPrefixed,
            &[Frame::new(FrameType::Response, "split-payload")],
        );

        for at in 1..bytes.len() {
            let (head, tail) = bytes.split_at(at);
            let reader = ScriptedReader::new(vec![
                Step::Data(head.to_vec()),
                Step::Data(tail.to_vec()),
            ]);
            let mut reader = FrameReader::with_config(reader, binary_config());

            let frame = reader.read_frame().unwrap();
            assert_eq!(frame.kind, FrameType::Response, "split at {at}");
            assert_eq!(frame.payload.as_ref(), b"split-payload", "split at {at}");
            assert_eq!(reader.buffered_len(), 0, "split at {at}");
            assert!(
                matches!(reader.read_frame().unwrap_err(), FrameError::ConnectionClosed),
                "split at {at}"
            );
        }
    }

    #[test]
    fn line_split_across_two_reads() {
        let frames = [
            Frame::new(FrameType::Command, "{\"type\":\"command\"}"),
            Frame::new(FrameType::Response, "{\"n\":2}"),
        ];
        let bytes = wire(WireFormat::LineDelimited, &frames);

        for at in 1..bytes.len() {
            let (head, tail) = bytes.split_at(at);
            let reader = ScriptedReader::new(vec![
                Step::Data(head.to_vec()),
                Step::Data(tail.to_vec()),
            ]);
            let mut reader = FrameReader::new(reader);

            for expected in &frames {
                assert_eq!(&reader.read_frame().unwrap(), expected, "split at {at}");
            }
            assert_eq!(reader.buffered_len(), 0, "split at {at}");
        }
    }

    #[test]
    fn long_line_in_small_chunks() {
        let body = "x".repeat(256 * 1024);
        let payload = format!("{{\"type\":\"command_response\",\"output\":\"{body}\"}}");
        let bytes = wire(
            WireFormat::LineDelimited,
            &[
                Frame::new(FrameType::Response, payload.clone()),
                Frame::new(FrameType::Error, "{\"type\":\"error\"}"),
            ],
        );
        let (head, tail) = bytes.split_at(128 * 1024);
        let mut steps: Vec<Step> = head.chunks(4096).map(|c| Step::Data(c.to_vec())).collect();
        steps.push(Step::Fail(ErrorKind::TimedOut));
        steps.extend(tail.chunks(4096).map(|c| Step::Data(c.to_vec())));
        let mut reader = FrameReader::new(ScriptedReader::new(steps));

        assert!(reader.read_frame().unwrap_err().is_retryable());
        assert_eq!(reader.buffered_len(), head.len());
        assert_eq!(reader.scanned, head.len());

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), payload.as_bytes());
        assert_eq!(reader.scanned, 0);

        let next = reader.read_frame().unwrap();
        assert_eq!(next.kind, FrameType::Error);
        assert_eq!(reader.scanned, 0);
    }

    #[test]
    fn partial_read_handling() {
        let bytes = wire(
            WireFormat::LineDelimited,
            &[Frame::new(FrameType::Error, "{\"type\":\"error\"}")],
        );
        let steps = bytes.iter().map(|b| Step::Data(vec![*b])).collect();
        let mut reader = FrameReader::new(ScriptedReader::new(steps));

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, FrameType::Error);
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_u32_le(FrameType::Response.as_u32());
        partial.put_u64_le(16);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::with_config(Cursor::new(partial.to_vec()), binary_config());
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut bytes = BytesMut::new();
        bytes.put_u32_le(FrameType::Response.as_u32());
        bytes.put_u64_le(17);

        let cfg = binary_config().with_max_payload_size(16);
        let mut reader = FrameReader::with_config(Cursor::new(bytes.to_vec()), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn timeout_keeps_buffered_bytes() {
        let bytes = wire(
            WireFormat::LineDelimited,
            &[Frame::new(FrameType::Response, "{\"n\":1}")],
        );
        let (head, tail) = bytes.split_at(3);
        let reader = ScriptedReader::new(vec![
            Step::Data(head.to_vec()),
            Step::Fail(ErrorKind::TimedOut),
            Step::Data(tail.to_vec()),
        ]);
        let mut reader = FrameReader::new(reader);

        let err = reader.read_frame().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(reader.buffered_len(), 3);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"{\"n\":1}"));
    }

    #[test]
    fn would_block_propagates_as_retryable() {
        let reader = ScriptedReader::new(vec![Step::Fail(ErrorKind::WouldBlock)]);
        let mut reader = FrameReader::new(reader);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(&err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
        assert!(err.is_retryable());
    }

    #[test]
    fn interrupted_read_retries() {
        let bytes = wire(
            WireFormat::LengthPrefixed,
            &[Frame::new(FrameType::Handshake, "ok")],
        );
        let reader = ScriptedReader::new(vec![Step::Fail(ErrorKind::Interrupted), Step::Data(bytes)]);
        let mut reader = FrameReader::with_config(reader, binary_config());
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, FrameType::Handshake);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn roundtrip_over_tcp_link() {
        use tether_transport::{Connector, LinkOptions, TcpConnector};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = crate::writer::FrameWriter::with_config(stream, binary_config());
            writer
                .send(FrameType::Command, b"{\"type\":\"command\"}")
                .unwrap();
        });

        let link = TcpConnector
            .connect("127.0.0.1", port, &LinkOptions::default())
            .unwrap();
        let mut reader = FrameReader::for_link(link, binary_config());
        let frame = reader.read_frame().unwrap();
        server.join().unwrap();

        assert_eq!(frame.kind, FrameType::Command);
    }

    enum Step {
        Data(Vec<u8>),
        Fail(ErrorKind),
    }

    struct ScriptedReader {
        steps: std::collections::VecDeque<Step>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Step::Fail(kind)) => Err(std::io::Error::from(kind)),
                Some(Step::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(Step::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }
}
