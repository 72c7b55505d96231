use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tether_transport::millis;

#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    connection_start: Option<Instant>,
    last_heartbeat_sent: Option<Instant>,
    last_heartbeat_received: Option<Instant>,
}

/// Per-connection traffic counters, shared by the workers.
#[derive(Debug, Default)]
pub struct Statistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    marks: Mutex<Marks>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting for a new connection established at `now`.
    ///
    /// The liveness clock starts here so a fresh connection is not
    /// immediately considered dead.
    pub fn reset(&self, now: Instant) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        *self.marks() = Marks {
            connection_start: Some(now),
            last_heartbeat_sent: None,
            last_heartbeat_received: Some(now),
        };
    }

    pub fn record_sent(&self, wire_bytes: usize) {
        self.bytes_sent
            .fetch_add(wire_bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound frame. Any inbound frame counts as proof of life.
    pub fn record_received(&self, wire_bytes: usize, now: Instant) {
        self.bytes_received
            .fetch_add(wire_bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.marks().last_heartbeat_received = Some(now);
    }

    pub fn record_heartbeat_sent(&self, now: Instant) {
        self.marks().last_heartbeat_sent = Some(now);
    }

    /// Time since the last inbound frame (or since connecting).
    pub fn since_last_received(&self, now: Instant) -> Option<Duration> {
        self.marks()
            .last_heartbeat_received
            .map(|at| now.saturating_duration_since(at))
    }

    /// Half the time since the last heartbeat went out.
    pub fn ping_estimate(&self, now: Instant) -> Option<Duration> {
        self.marks()
            .last_heartbeat_sent
            .map(|at| now.saturating_duration_since(at) / 2)
    }

    pub fn snapshot(&self, now: Instant) -> StatsSnapshot {
        let marks = *self.marks();
        let since =
            |at: Option<Instant>| at.map(|at| millis::as_u64(now.saturating_duration_since(at)));
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connection_duration_ms: since(marks.connection_start),
            since_heartbeat_sent_ms: since(marks.last_heartbeat_sent),
            since_heartbeat_received_ms: since(marks.last_heartbeat_received),
        }
    }

    fn marks(&self) -> MutexGuard<'_, Marks> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_heartbeat_sent_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_heartbeat_received_ms: Option<u64>,
}
