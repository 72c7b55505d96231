//! Heartbeat sequencing and liveness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tether_frame::{Envelope, Frame, FrameType, Message};

use crate::error::Result;

/// Hands out heartbeat sequence numbers: 1, 2, 3, ...
#[derive(Debug, Default)]
pub struct HeartbeatSequence(AtomicU64);

impl HeartbeatSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Last number handed out, 0 if none.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// True once the silence has lasted strictly longer than the window.
pub fn is_expired(silence: Duration, window: Duration) -> bool {
    silence > window
}

/// Heartbeat frame for `sequence`.
pub fn heartbeat_frame(client_id: &str, sequence: u64) -> Result<Frame> {
    Ok(Envelope::new(client_id, Message::heartbeat(sequence)).into_frame()?)
}

/// The acknowledgement a controller sends back for an inbound heartbeat.
///
/// Returns `None` for any other frame.
pub fn ack_for(frame: &Frame, responder_id: &str) -> Result<Option<Frame>> {
    if frame.kind != FrameType::Heartbeat {
        return Ok(None);
    }
    let sequence = match Envelope::from_frame(frame) {
        Ok(Envelope {
            body: Message::Heartbeat { sequence },
            ..
        }) => Some(sequence),
        _ => None,
    };
    let ack = Envelope::new(responder_id, Message::heartbeat_response(sequence)).into_frame()?;
    Ok(Some(ack))
}

/// Sequence number carried by a heartbeat frame.
pub fn sequence_of(frame: &Frame) -> Option<u64> {
    match Envelope::from_frame(frame).ok()?.body {
        Message::Heartbeat { sequence } => Some(sequence),
        _ => None,
    }
}
