use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tether_frame::{Frame, FrameType};
use tether_session::{Dispatcher, Session, SessionError};
use tracing::debug;

use crate::cmd::{parse_duration, session_config, SendArgs};
use crate::exit::{session_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_frame, OutputFormat};

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
enum Event {
    Connected,
    Frame(Frame),
    Failed(String),
}

/// Forwards session callbacks to the command thread.
struct ChannelDispatcher {
    events: Sender<Event>,
}

impl Dispatcher for ChannelDispatcher {
    fn on_message(&self, frame: &Frame) {
        let _ = self.events.send(Event::Frame(frame.clone()));
    }

    fn on_connection_state_changed(&self, connected: bool) {
        if connected {
            let _ = self.events.send(Event::Connected);
        }
    }

    fn on_error(&self, error: &SessionError) {
        let _ = self.events.send(Event::Failed(error.to_string()));
    }
}

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let config = session_config(&args.target)?;
    let payload = resolve_payload(&args)?;
    let peer = format!("{}:{}", config.host, config.port);

    let (events_tx, events_rx) = unbounded();
    let session = Session::builder(config)
        .dispatcher(Arc::new(ChannelDispatcher { events: events_tx }))
        .build();
    session
        .start()
        .map_err(|err| session_error("start failed", err))?;

    let deadline = Instant::now() + wait_timeout;
    wait_for_connected(&events_rx, deadline, || session.is_running())?;

    let delivered = session
        .send_frame_confirmed(args.kind.into(), payload)
        .map_err(|err| session_error("send failed", err))?;
    let bytes = wait_for_delivery(&delivered, deadline)?;
    debug!(%peer, bytes, "message delivered");

    if args.wait {
        let frame = wait_for_reply(&events_rx, deadline)?;
        print_frame(&frame, &peer, format);
    }

    session.stop();
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

/// Block until the session reports a connection, gives up, or `deadline` passes.
fn wait_for_connected(
    events: &Receiver<Event>,
    deadline: Instant,
    running: impl Fn() -> bool,
) -> CliResult<()> {
    let mut last_error = None;
    loop {
        match events.recv_timeout(POLL) {
            Ok(Event::Connected) => return Ok(()),
            Ok(Event::Failed(err)) => {
                debug!(error = %err, "connection attempt failed");
                last_error = Some(err);
            }
            Ok(Event::Frame(_)) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CliError::new(FAILURE, "session ended"));
            }
        }

        let detail = last_error
            .as_deref()
            .map(|err| format!(": {err}"))
            .unwrap_or_default();
        if !running() {
            return Err(CliError::new(FAILURE, format!("connect failed{detail}")));
        }
        if Instant::now() >= deadline {
            return Err(CliError::new(TIMEOUT, format!("not connected in time{detail}")));
        }
    }
}

/// First application frame before `deadline`. Handshakes are skipped.
fn wait_for_reply(events: &Receiver<Event>, deadline: Instant) -> CliResult<Frame> {
    loop {
        match events.recv_deadline(deadline) {
            Ok(Event::Frame(frame)) if frame.kind != FrameType::Handshake => return Ok(frame),
            Ok(Event::Failed(err)) => {
                return Err(CliError::new(FAILURE, format!("connection lost: {err}")));
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                return Err(CliError::new(TIMEOUT, "no response before timeout"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CliError::new(FAILURE, "session ended"));
            }
        }
    }
}

/// Wait for the send worker to confirm it wrote our frame.
fn wait_for_delivery(delivered: &Receiver<usize>, deadline: Instant) -> CliResult<usize> {
    match delivered.recv_deadline(deadline) {
        Ok(bytes) => Ok(bytes),
        Err(RecvTimeoutError::Timeout) => {
            Err(CliError::new(TIMEOUT, "message was not delivered in time"))
        }
        Err(RecvTimeoutError::Disconnected) => Err(CliError::new(
            FAILURE,
            "message was dropped before it was written",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(300)
    }

    #[test]
    fn reply_skips_handshakes() {
        let (tx, rx) = unbounded();
        tx.send(Event::Connected).unwrap();
        tx.send(Event::Frame(Frame::new(FrameType::Handshake, &b"{}"[..])))
            .unwrap();
        tx.send(Event::Frame(Frame::new(FrameType::Command, &b"{\"type\":\"command\"}"[..])))
            .unwrap();

        let frame = wait_for_reply(&rx, soon()).expect("reply should arrive");
        assert_eq!(frame.kind, FrameType::Command);
    }

    #[test]
    fn reply_times_out() {
        let (_tx, rx) = unbounded::<Event>();
        let err = wait_for_reply(&rx, soon()).expect_err("nothing was sent");
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn delivery_wait_returns_written_size() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(42).unwrap();
        assert_eq!(wait_for_delivery(&rx, soon()).unwrap(), 42);
    }

    #[test]
    fn delivery_wait_times_out_without_confirmation() {
        let (_tx, rx) = crossbeam_channel::bounded::<usize>(1);
        let err = wait_for_delivery(&rx, soon()).expect_err("nothing was written");
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn dropped_message_is_a_failure() {
        let (tx, rx) = crossbeam_channel::bounded::<usize>(1);
        drop(tx);
        let err = wait_for_delivery(&rx, soon()).expect_err("message was dropped");
        assert_eq!(err.code, FAILURE);
    }

    #[test]
    fn connect_wait_reports_last_failure_when_session_gives_up() {
        let (tx, rx) = unbounded();
        tx.send(Event::Failed("connection refused".to_string()))
            .unwrap();

        let err = wait_for_connected(&rx, soon(), || false).expect_err("session gave up");
        assert_eq!(err.code, FAILURE);
        assert!(err.message.contains("connection refused"));
    }

    #[test]
    fn connect_wait_returns_on_connected() {
        let (tx, rx) = unbounded();
        tx.send(Event::Failed("refused".to_string())).unwrap();
        tx.send(Event::Connected).unwrap();
        assert!(wait_for_connected(&rx, soon(), || true).is_ok());
    }
}
