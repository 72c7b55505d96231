//! The three per-connection workers.
//!
//! Each worker owns nothing but clones of shared handles and reports exactly
//! one [`WorkerExit`] when it ends. Dropping the halt sender wakes all of them.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};
use tether_frame::{Frame, FrameConfig, FrameError, FrameReader, FrameType, FrameWriter};
use tether_transport::{Link, TransportError};
use tracing::{debug, error, trace, warn};

use crate::dispatch::{Dispatcher, TelemetrySource};
use crate::error::SessionError;
use crate::heartbeat::{heartbeat_frame, is_expired, HeartbeatSequence};
use crate::stats::Statistics;

/// A frame waiting in the send queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub frame: Frame,
    pub enqueued_at: Instant,
    pub is_heartbeat: bool,
    /// Receives the wire size once this frame has been written to the link.
    pub delivered: Option<Sender<usize>>,
}

impl OutboundMessage {
    pub fn new(frame: Frame) -> Self {
        Self {
            is_heartbeat: frame.kind == FrameType::Heartbeat,
            frame,
            enqueued_at: Instant::now(),
            delivered: None,
        }
    }

    pub fn with_delivery(mut self, delivered: Sender<usize>) -> Self {
        self.delivered = Some(delivered);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    Send,
    Receive,
    Heartbeat,
}

impl WorkerKind {
    pub(crate) fn thread_name(self) -> &'static str {
        match self {
            Self::Send => "tether-send",
            Self::Receive => "tether-recv",
            Self::Heartbeat => "tether-heartbeat",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.thread_name())
    }
}

#[derive(Debug)]
pub(crate) enum ExitReason {
    /// Told to stop, or the link was closed under it.
    Halted,
    Failed(SessionError),
}

#[derive(Debug)]
pub(crate) struct WorkerExit {
    pub(crate) worker: WorkerKind,
    pub(crate) reason: ExitReason,
}

fn report(exits: &Sender<WorkerExit>, worker: WorkerKind, reason: ExitReason) {
    // The control loop may already be gone after teardown.
    let _ = exits.send(WorkerExit { worker, reason });
}

pub(crate) struct SendWorker {
    pub(crate) link: Arc<dyn Link>,
    pub(crate) frame_config: FrameConfig,
    pub(crate) queue: Receiver<OutboundMessage>,
    pub(crate) halt: Receiver<()>,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) exits: Sender<WorkerExit>,
}

impl SendWorker {
    pub(crate) fn run(self) {
        let mut writer = FrameWriter::for_link(Arc::clone(&self.link), self.frame_config);
        let reason = loop {
            select! {
                recv(self.queue) -> message => {
                    let Ok(message) = message else {
                        break ExitReason::Halted;
                    };
                    match writer.write_frame(&message.frame) {
                        Ok(written) => {
                            self.stats.record_sent(written);
                            if let Some(delivered) = &message.delivered {
                                // The caller may have stopped waiting.
                                let _ = delivered.send(written);
                            }
                            if !message.is_heartbeat {
                                trace!(
                                    kind = %message.frame.kind,
                                    bytes = written,
                                    queued_for = ?message.enqueued_at.elapsed(),
                                    "message sent"
                                );
                            }
                        }
                        Err(err @ (FrameError::PayloadTooLarge { .. } | FrameError::EmbeddedDelimiter)) => {
                            warn!(error = %err, kind = %message.frame.kind, "dropping unsendable message");
                        }
                        Err(_) if self.link.is_closed() => break ExitReason::Halted,
                        Err(err) => break ExitReason::Failed(err.into()),
                    }
                }
                recv(self.halt) -> _ => break ExitReason::Halted,
            }
        };
        report(&self.exits, WorkerKind::Send, reason);
    }
}

pub(crate) struct ReceiveWorker {
    pub(crate) link: Arc<dyn Link>,
    pub(crate) frame_config: FrameConfig,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) exits: Sender<WorkerExit>,
}

impl ReceiveWorker {
    pub(crate) fn run(self) {
        let format = self.frame_config.wire_format;
        let mut reader = FrameReader::for_link(Arc::clone(&self.link), self.frame_config);
        let reason = loop {
            match reader.read_frame() {
                Ok(frame) => {
                    self.stats
                        .record_received(frame.wire_size(format), Instant::now());
                    if frame.kind == FrameType::HeartbeatAck {
                        debug!("heartbeat acknowledged");
                        continue;
                    }
                    self.dispatcher.on_message(&frame);
                }
                Err(_) if self.link.is_closed() => break ExitReason::Halted,
                Err(err) if err.is_retryable() => continue,
                Err(FrameError::ConnectionClosed) => {
                    debug!(buffered = reader.buffered_len(), "peer closed the connection");
                    break ExitReason::Failed(TransportError::Closed.into());
                }
                Err(err) if err.is_protocol_violation() => {
                    error!(error = %err, "protocol violation from peer");
                    break ExitReason::Failed(err.into());
                }
                Err(err) => break ExitReason::Failed(err.into()),
            }
        };
        report(&self.exits, WorkerKind::Receive, reason);
    }
}

pub(crate) struct HeartbeatWorker {
    pub(crate) client_id: String,
    pub(crate) interval: Duration,
    pub(crate) liveness_window: Duration,
    pub(crate) telemetry_interval: Option<Duration>,
    pub(crate) telemetry: Option<Arc<dyn TelemetrySource>>,
    pub(crate) sequence: Arc<HeartbeatSequence>,
    pub(crate) queue: Sender<OutboundMessage>,
    pub(crate) halt: Receiver<()>,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) exits: Sender<WorkerExit>,
}

impl HeartbeatWorker {
    pub(crate) fn run(self) {
        let reason = self.beat();
        report(&self.exits, WorkerKind::Heartbeat, reason);
    }

    fn beat(&self) -> ExitReason {
        let start = Instant::now();
        let mut next_beat = start + self.interval;
        let mut next_telemetry = match (&self.telemetry, self.telemetry_interval) {
            (Some(_), Some(interval)) => Some(start + interval),
            _ => None,
        };

        loop {
            let wake = next_telemetry.map_or(next_beat, |at| at.min(next_beat));
            match self.halt.recv_deadline(wake) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return ExitReason::Halted,
            }

            let now = Instant::now();
            if now >= next_beat {
                next_beat = now + self.interval;
                if let Err(reason) = self.send_heartbeat(now) {
                    return reason;
                }

                let silence = self.stats.since_last_received(now).unwrap_or_default();
                if is_expired(silence, self.liveness_window) {
                    warn!(?silence, window = ?self.liveness_window, "heartbeat timeout");
                    return ExitReason::Failed(SessionError::HeartbeatTimeout(silence));
                }
            }

            if let Some(due) = next_telemetry {
                if now >= due {
                    next_telemetry = self.telemetry_interval.map(|interval| now + interval);
                    if let Err(reason) = self.send_telemetry() {
                        return reason;
                    }
                }
            }
        }
    }

    fn send_heartbeat(&self, now: Instant) -> Result<(), ExitReason> {
        let sequence = self.sequence.next();
        let frame = heartbeat_frame(&self.client_id, sequence).map_err(ExitReason::Failed)?;
        self.queue
            .send(OutboundMessage::new(frame))
            .map_err(|_| ExitReason::Halted)?;
        self.stats.record_heartbeat_sent(now);
        trace!(sequence, "heartbeat queued");
        Ok(())
    }

    fn send_telemetry(&self) -> Result<(), ExitReason> {
        let Some(source) = &self.telemetry else {
            return Ok(());
        };
        let Some(snapshot) = source.collect_snapshot() else {
            return Ok(());
        };
        self.queue
            .send(OutboundMessage::new(Frame::new(FrameType::Telemetry, snapshot)))
            .map_err(|_| ExitReason::Halted)
    }
}
