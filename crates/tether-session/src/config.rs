use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_frame::{FrameConfig, WireFormat, DEFAULT_MAX_PAYLOAD, DEFAULT_READ_CHUNK};
use tether_transport::LinkOptions;

use crate::error::{Result, SessionError};

/// Default controller host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default controller port.
pub const DEFAULT_PORT: u16 = 8080;
/// Liveness window in heartbeat intervals.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER: u32 = 3;

/// Session behavior for one start/stop cycle.
///
/// Durations serialize as integer milliseconds under `*_ms` keys.
/// `max_reconnect_attempts` serializes as `-1` when unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "connect_timeout_ms", with = "tether_transport::millis")]
    pub connect_timeout: Duration,
    /// Socket read/write timeout. Zero blocks indefinitely.
    #[serde(rename = "io_timeout_ms", with = "tether_transport::millis")]
    pub io_timeout: Duration,
    /// Fixed pause between connection attempts.
    #[serde(rename = "reconnect_delay_ms", with = "tether_transport::millis")]
    pub reconnect_delay: Duration,
    /// Consecutive failing connects before giving up. `None` retries forever.
    #[serde(with = "attempts")]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(rename = "heartbeat_interval_ms", with = "tether_transport::millis")]
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout_multiplier: u32,
    pub receive_buffer_size: usize,
    pub max_payload_size: usize,
    pub wire_format: WireFormat,
    /// Identifier stamped on every outbound envelope.
    pub client_id: String,
    /// Telemetry snapshot period. `None` disables telemetry.
    #[serde(rename = "telemetry_interval_ms", with = "tether_transport::millis::option")]
    pub telemetry_interval: Option<Duration>,
    /// Write a handshake envelope right after connecting.
    pub send_handshake: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout_multiplier: DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER,
            receive_buffer_size: DEFAULT_READ_CHUNK,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            wire_format: WireFormat::default(),
            client_id: default_client_id(),
            telemetry_interval: None,
            send_handshake: true,
        }
    }
}

impl SessionConfig {
    /// Config targeting `host:port` with every other field defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_telemetry_interval(mut self, interval: Option<Duration>) -> Self {
        self.telemetry_interval = interval;
        self
    }

    pub fn with_handshake(mut self, send_handshake: bool) -> Self {
        self.send_handshake = send_handshake;
        self
    }

    /// Reject configurations the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect timeout must be positive"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat interval must be positive"));
        }
        if self.heartbeat_timeout_multiplier == 0 {
            return Err(invalid("heartbeat timeout multiplier must be at least 1"));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(invalid(
                "max reconnect attempts must be at least 1 (use -1 for unlimited)",
            ));
        }
        if self.receive_buffer_size == 0 {
            return Err(invalid("receive buffer size must be positive"));
        }
        if self.max_payload_size == 0 {
            return Err(invalid("max payload size must be positive"));
        }
        if matches!(self.telemetry_interval, Some(interval) if interval.is_zero()) {
            return Err(invalid("telemetry interval must be positive"));
        }
        Ok(())
    }

    /// No inbound traffic for longer than this ends the connection.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.heartbeat_timeout_multiplier)
    }

    pub fn link_options(&self) -> LinkOptions {
        let io_timeout = (!self.io_timeout.is_zero()).then_some(self.io_timeout);
        LinkOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: io_timeout,
            write_timeout: io_timeout,
            ..LinkOptions::default()
        }
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
            wire_format: self.wire_format,
            read_chunk_size: self.receive_buffer_size,
        }
    }
}

fn invalid(reason: &str) -> SessionError {
    SessionError::InvalidConfig(reason.to_string())
}

fn default_client_id() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("client_{}", std::process::id()))
}

mod attempts {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.map_or(-1, i64::from))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            return Ok(None);
        }
        u32::try_from(raw).map(Some).map_err(de::Error::custom)
    }
}
