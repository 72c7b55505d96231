//! Message framing for tether links.
//!
//! Two codecs, selected per connection by [`WireFormat`]:
//! - **Length-prefixed**: a 4-byte little-endian frame type, an 8-byte
//!   little-endian payload length, then the payload
//! - **Line-delimited**: one JSON object per `\n`-terminated line, with the
//!   frame type taken from the object's `type` field
//!
//! [`FrameReader`] and [`FrameWriter`] hide partial reads and writes, and
//! [`message`] holds the structured messages carried inside frames.

pub mod codec;
pub mod error;
pub mod kind;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, decode_line_from, encode_frame, Frame, FrameConfig, WireFormat,
    DEFAULT_MAX_PAYLOAD, DEFAULT_READ_CHUNK, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use kind::FrameType;
pub use message::{Envelope, Message, PROTOCOL_VERSION};
pub use reader::FrameReader;
pub use writer::FrameWriter;
