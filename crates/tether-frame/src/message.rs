//! Structured messages carried inside frames.
//!
//! Every message is a JSON object with a `type` tag plus the envelope fields
//! `timestamp` and `client_id`:
//!
//! ```json
//! {"type":"heartbeat","sequence":3,"timestamp":"2024-05-01T12:00:00Z","client_id":"host-1"}
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Frame;
use crate::error::Result;
use crate::kind::FrameType;

/// Protocol version announced in handshakes.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Timestamp layout: RFC 3339, UTC, whole seconds.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Message body, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Handshake {
        version: String,
        client_name: String,
        #[serde(default)]
        capabilities: BTreeMap<String, String>,
    },
    HandshakeResponse {
        #[serde(default)]
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Heartbeat {
        sequence: u64,
    },
    HeartbeatResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },
    SystemInfo {
        #[serde(default)]
        info: BTreeMap<String, String>,
    },
    Command {
        command_id: String,
        command_type: String,
        #[serde(default)]
        command: String,
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
    CommandResponse {
        command_id: String,
        success: bool,
        #[serde(default)]
        output: String,
        #[serde(default)]
        error_code: i32,
    },
    ScreenCapture {
        format: String,
        width: u32,
        height: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Error {
        code: i32,
        message: String,
    },
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Message {
    /// Frame kind this message travels as.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Handshake { .. } => FrameType::Handshake,
            Self::Heartbeat { .. } => FrameType::Heartbeat,
            Self::HeartbeatResponse { .. } => FrameType::HeartbeatAck,
            Self::SystemInfo { .. } => FrameType::Telemetry,
            Self::Command { .. } => FrameType::Command,
            Self::Error { .. } => FrameType::Error,
            Self::HandshakeResponse { .. }
            | Self::CommandResponse { .. }
            | Self::ScreenCapture { .. }
            | Self::Disconnect { .. } => FrameType::Response,
        }
    }

    pub fn heartbeat(sequence: u64) -> Self {
        Self::Heartbeat { sequence }
    }

    pub fn heartbeat_response(sequence: Option<u64>) -> Self {
        Self::HeartbeatResponse { sequence }
    }

    pub fn handshake(client_name: impl Into<String>) -> Self {
        Self::Handshake {
            version: PROTOCOL_VERSION.to_string(),
            client_name: client_name.into(),
            capabilities: BTreeMap::new(),
        }
    }
}

/// A message plus the fields every message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: Message,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub client_id: String,
}

impl Envelope {
    /// Wrap a message, stamped with the current time.
    pub fn new(client_id: impl Into<String>, body: Message) -> Self {
        Self::at(Utc::now(), client_id, body)
    }

    /// Wrap a message with an explicit timestamp.
    pub fn at(time: DateTime<Utc>, client_id: impl Into<String>, body: Message) -> Self {
        Self {
            body,
            timestamp: time.format(TIMESTAMP_FORMAT).to_string(),
            client_id: client_id.into(),
        }
    }

    /// Compact JSON. Never contains a raw newline, so it is safe for either codec.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse the payload of a received frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Self::from_slice(&frame.payload)
    }

    pub fn into_frame(self) -> Result<Frame> {
        let kind = self.body.frame_type();
        Ok(Frame::new(kind, self.to_bytes()?))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}
