use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::kind::FrameType;

/// Binary frame header: type (4) + length (8) = 12 bytes.
pub const HEADER_SIZE: usize = 12;

/// Text record delimiter.
pub const DELIMITER: u8 = b'\n';

/// Default maximum payload size: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Default read chunk size: 4 KiB.
pub const DEFAULT_READ_CHUNK: usize = 4 * 1024;

/// A framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the message is.
    pub kind: FrameType,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// The payload as UTF-8, if it is.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// The total wire size of this frame in the given format.
    pub fn wire_size(&self, format: WireFormat) -> usize {
        match format {
            WireFormat::LengthPrefixed => HEADER_SIZE + self.payload.len(),
            WireFormat::LineDelimited => self.payload.len() + 1,
        }
    }
}

/// Which codec a session speaks. Exactly one per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// One JSON object per `\n`-terminated line.
    #[default]
    LineDelimited,
    /// `[type u32 LE][length u64 LE][payload]`.
    LengthPrefixed,
}

/// Encode a frame into the selected wire format.
pub fn encode_frame(format: WireFormat, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    match format {
        WireFormat::LengthPrefixed => encode_length_prefixed(frame, dst),
        WireFormat::LineDelimited => encode_line(&frame.payload, dst),
    }
}

/// Decode one frame from a buffer in the selected wire format.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(
    format: WireFormat,
    src: &mut BytesMut,
    max_payload: usize,
) -> Result<Option<Frame>> {
    match format {
        WireFormat::LengthPrefixed => decode_length_prefixed(src, max_payload),
        WireFormat::LineDelimited => decode_line(src, max_payload),
    }
}

/// Encode a binary frame.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────────┬─────────────────┐
/// │ Type       │ Length       │ Payload          │
/// │ (4B LE)    │ (8B LE)      │ (Length bytes)   │
/// └────────────┴──────────────┴─────────────────┘
/// ```
pub fn encode_length_prefixed(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    dst.reserve(HEADER_SIZE + frame.payload.len());
    dst.put_u32_le(frame.kind.as_u32());
    dst.put_u64_le(frame.payload.len() as u64);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a binary frame.
///
/// The header is validated before any payload is buffered.
pub fn decode_length_prefixed(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &src[..HEADER_SIZE];
    let raw_kind = header.get_u32_le();
    let declared = header.get_u64_le();

    let kind = FrameType::from_u32(raw_kind).ok_or(FrameError::UnknownType(raw_kind))?;

    let payload_len = match usize::try_from(declared) {
        Ok(len) if len <= max_payload => len,
        _ => {
            return Err(FrameError::PayloadTooLarge {
                size: usize::try_from(declared).unwrap_or(usize::MAX),
                max: max_payload,
            })
        }
    };

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { kind, payload }))
}

/// Encode a text record: the payload followed by `\n`.
pub fn encode_line(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.contains(&DELIMITER) {
        return Err(FrameError::EmbeddedDelimiter);
    }
    dst.reserve(payload.len() + 1);
    dst.put_slice(payload);
    dst.put_u8(DELIMITER);
    Ok(())
}

/// Decode a text record.
///
/// Empty lines are skipped. A trailing `\r` is stripped. The frame kind comes
/// from the record's `type` field.
pub fn decode_line(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    decode_line_from(src, max_payload, &mut 0)
}

/// Like [`decode_line`], but skips the first `scanned` bytes when looking
/// for the delimiter.
///
/// `scanned` must count bytes at the front of `src` already known to hold no
/// delimiter. It is advanced to `src.len()` when no record is complete and
/// reset to zero whenever a line is split off, so a reader that feeds the same
/// counter back on every call searches each received byte once.
pub fn decode_line_from(
    src: &mut BytesMut,
    max_payload: usize,
    scanned: &mut usize,
) -> Result<Option<Frame>> {
    loop {
        let start = (*scanned).min(src.len());
        let Some(pos) = src[start..]
            .iter()
            .position(|b| *b == DELIMITER)
            .map(|offset| start + offset)
        else {
            *scanned = src.len();
            // Allow one extra byte for a pending `\r`.
            if src.len() > max_payload.saturating_add(1) {
                return Err(FrameError::PayloadTooLarge {
                    size: src.len(),
                    max: max_payload,
                });
            }
            return Ok(None);
        };

        let mut line = src.split_to(pos);
        src.advance(1);
        *scanned = 0;
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if line.len() > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: line.len(),
                max: max_payload,
            });
        }

        let kind = classify_line(&line)?;
        return Ok(Some(Frame {
            kind,
            payload: line.freeze(),
        }));
    }
}

#[derive(Deserialize)]
struct TypeField {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

fn classify_line(line: &[u8]) -> Result<FrameType> {
    let field: TypeField = serde_json::from_slice(line)
        .map_err(|err| FrameError::Malformed(format!("record is not a JSON object: {err}")))?;
    Ok(field
        .kind
        .as_deref()
        .map_or(FrameType::Response, FrameType::from_message_type))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 1 MiB.
    pub max_payload_size: usize,
    /// Codec for this connection.
    pub wire_format: WireFormat,
    /// Bytes requested per `read` call. Default: 4 KiB.
    pub read_chunk_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            wire_format: WireFormat::default(),
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

impl FrameConfig {
    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }
}
