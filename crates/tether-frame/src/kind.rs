//! Frame types.
//!
//! On the binary wire the type is a 4-byte little-endian tag. On the text
//! wire it is derived from the JSON `type` field of each line.

use serde::{Deserialize, Serialize};

/// The kind of a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum FrameType {
    /// Controller-issued command.
    Command = 0,
    /// Client reply or any other application traffic.
    Response = 1,
    /// Error notification.
    Error = 2,
    /// Liveness probe carrying a sequence number.
    Heartbeat = 3,
    /// Answer to a heartbeat. Consumed by the session, never dispatched.
    HeartbeatAck = 4,
    /// Periodic system-information snapshot.
    Telemetry = 5,
    /// Connection greeting.
    Handshake = 6,
}

impl FrameType {
    /// Decode a binary type tag.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Command),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::HeartbeatAck),
            5 => Some(Self::Telemetry),
            6 => Some(Self::Handshake),
            _ => None,
        }
    }

    /// The binary type tag.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Classify a text-wire message by its JSON `type` value.
    pub fn from_message_type(value: &str) -> Self {
        match value {
            "command" => Self::Command,
            "error" => Self::Error,
            "heartbeat" => Self::Heartbeat,
            "heartbeat_response" => Self::HeartbeatAck,
            "system_info" => Self::Telemetry,
            "handshake" => Self::Handshake,
            _ => Self::Response,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::Response => "RESPONSE",
            Self::Error => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::Telemetry => "TELEMETRY",
            Self::Handshake => "HANDSHAKE",
        }
    }

    /// Heartbeat traffic in either direction.
    pub fn is_heartbeat(self) -> bool {
        matches!(self, Self::Heartbeat | Self::HeartbeatAck)
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_legacy_numbering() {
        assert_eq!(FrameType::Command.as_u32(), 0);
        assert_eq!(FrameType::Response.as_u32(), 1);
        assert_eq!(FrameType::Error.as_u32(), 2);
    }

    #[test]
    fn every_tag_decodes_back() {
        for raw in 0..=6 {
            let kind = FrameType::from_u32(raw).unwrap();
            assert_eq!(kind.as_u32(), raw);
        }
        assert_eq!(FrameType::from_u32(7), None);
    }

    #[test]
    fn text_types_classify() {
        assert_eq!(
            FrameType::from_message_type("heartbeat_response"),
            FrameType::HeartbeatAck
        );
        assert_eq!(FrameType::from_message_type("command"), FrameType::Command);
        assert_eq!(
            FrameType::from_message_type("command_response"),
            FrameType::Response
        );
        assert!(FrameType::Heartbeat.is_heartbeat());
        assert!(!FrameType::Telemetry.is_heartbeat());
    }
}
