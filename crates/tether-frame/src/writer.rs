use std::io::{ErrorKind, Write};
use std::sync::Arc;

use bytes::BytesMut;
use tether_transport::{Link, LinkIo};
use tracing::trace;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::kind::FrameType;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// Each frame is encoded once and written until every byte is accepted.
/// Partial writes and write timeouts resume at the current offset.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame (blocking). Returns the number of wire bytes.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<usize> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(self.config.wire_format, frame, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    trace!(offset, total = self.buf.len(), "write timed out, resuming");
                    continue;
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()?;
        Ok(offset)
    }

    /// Encode and send a payload of the given kind.
    pub fn send(&mut self, kind: FrameType, payload: &[u8]) -> Result<usize> {
        self.write_frame(&Frame::new(kind, bytes::Bytes::copy_from_slice(payload)))
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<LinkIo> {
    /// Create a frame writer over a shared link.
    pub fn for_link(link: Arc<dyn Link>, config: FrameConfig) -> Self {
        Self::with_config(LinkIo::new(link), config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::codec::{decode_frame, WireFormat, HEADER_SIZE};

    fn binary_config() -> FrameConfig {
        FrameConfig::default().with_wire_format(WireFormat::LengthPrefixed)
    }

    fn decode_all(format: WireFormat, bytes: Vec<u8>) -> Vec<Frame> {
        let mut wire = BytesMut::from(bytes.as_slice());
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(format, &mut wire, usize::MAX).unwrap() {
            frames.push(frame);
        }
        assert!(wire.is_empty());
        frames
    }

    #[test]
    fn write_single_binary_frame() {
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), binary_config());

        let written = writer.send(FrameType::Command, b"hello").unwrap();
        assert_eq!(written, HEADER_SIZE + 5);

        let frames = decode_all(WireFormat::LengthPrefixed, writer.into_inner().into_inner());
        assert_eq!(frames, vec![Frame::new(FrameType::Command, "hello")]);
    }

    #[test]
    fn writes_preserve_order() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));

        for n in 0..5 {
            let payload = format!("{{\"type\":\"command_response\",\"n\":{n}}}");
            writer.send(FrameType::Response, payload.as_bytes()).unwrap();
        }

        let frames = decode_all(WireFormat::LineDelimited, writer.into_inner().into_inner());
        let order: Vec<String> = frames
            .iter()
            .map(|f| f.payload_str().unwrap().to_string())
            .collect();
        assert_eq!(order.len(), 5);
        for (n, line) in order.iter().enumerate() {
            assert!(line.ends_with(&format!("\"n\":{n}}}")));
        }
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = binary_config().with_max_payload_size(4);
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), cfg);

        let err = writer.send(FrameType::Response, b"oversized").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 9, max: 4 }));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn embedded_newline_rejected_in_text_mode() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        let err = writer.send(FrameType::Response, b"{}\n{}").unwrap_err();
        assert!(matches!(err, FrameError::EmbeddedDelimiter));
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.send(FrameType::Response, b"{}").unwrap();

        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn partial_writes_resume_at_offset() {
        let sink = ScriptedWriter::new(vec![Ok(3), Err(ErrorKind::TimedOut), Ok(2), Err(ErrorKind::Interrupted)]);
        let mut writer = FrameWriter::with_config(sink, binary_config());

        writer.send(FrameType::Telemetry, b"resume-me").unwrap();

        let frames = decode_all(WireFormat::LengthPrefixed, writer.into_inner().data);
        assert_eq!(frames, vec![Frame::new(FrameType::Telemetry, "resume-me")]);
    }

    #[test]
    fn would_block_write_and_flush_retry() {
        let sink = ScriptedWriter::new(vec![Err(ErrorKind::WouldBlock)]).flush_would_block_once();
        let mut writer = FrameWriter::new(sink);
        writer.send(FrameType::Response, b"{\"ok\":true}").unwrap();

        let inner = writer.into_inner();
        assert_eq!(inner.data, b"{\"ok\":true}\n");
    }

    #[test]
    fn hard_error_is_not_retried() {
        let sink = ScriptedWriter::new(vec![Err(ErrorKind::BrokenPipe)]);
        let mut writer = FrameWriter::new(sink);
        let err = writer.send(FrameType::Response, b"{}").unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::BrokenPipe));
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(FrameType::Response, b"{}").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn written_bytes_read_back() {
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), binary_config());
        writer.send(FrameType::HeartbeatAck, b"z").unwrap();

        let wire = writer.into_inner().into_inner();
        let mut framed = crate::reader::FrameReader::with_config(Cursor::new(wire), binary_config());
        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.kind, FrameType::HeartbeatAck);
        assert_eq!(frame.payload.as_ref(), b"z");
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Plays back a script of write outcomes, then accepts everything.
    struct ScriptedWriter {
        script: std::collections::VecDeque<std::result::Result<usize, ErrorKind>>,
        flush_would_block: bool,
        data: Vec<u8>,
    }

    impl ScriptedWriter {
        fn new(script: Vec<std::result::Result<usize, ErrorKind>>) -> Self {
            Self {
                script: script.into(),
                flush_would_block: false,
                data: Vec::new(),
            }
        }

        fn flush_would_block_once(mut self) -> Self {
            self.flush_would_block = true;
            self
        }
    }

    impl Write for ScriptedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            match self.script.pop_front() {
                Some(Err(kind)) => Err(std::io::Error::from(kind)),
                Some(Ok(limit)) => {
                    let n = limit.min(buf.len());
                    self.data.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                None => {
                    self.data.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if std::mem::take(&mut self.flush_would_block) {
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
