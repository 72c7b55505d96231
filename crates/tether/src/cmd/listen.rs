use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tether_frame::{FrameConfig, FrameError, FrameType};
use tether_session::{ControllerListener, SessionError};
use tether_transport::TransportError;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, ListenArgs};
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener = ControllerListener::bind(args.addr)
        .map_err(|err| session_error("bind failed", err))?
        .with_frame_config(FrameConfig::default().with_wire_format(args.wire_format.into()))
        .with_auto_ack(!args.no_ack);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let mut client = listener
            .accept()
            .map_err(|err| session_error("accept failed", err))?;

        while running.load(Ordering::SeqCst) {
            let frame = match client.recv() {
                Ok(frame) => frame,
                Err(err) if client_left(&err) => {
                    info!(client = client.id(), "client disconnected");
                    break;
                }
                Err(err) => return Err(session_error("receive failed", err)),
            };

            if args.quiet && matches!(frame.kind, FrameType::Heartbeat | FrameType::Handshake) {
                continue;
            }

            print_frame(&frame, client.id(), format);
            printed = printed.saturating_add(1);

            if let Some(count) = args.count {
                if printed >= count {
                    return Ok(SUCCESS);
                }
            }
        }
    }

    Ok(SUCCESS)
}

/// End of one client, not of the listener.
fn client_left(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::Frame(FrameError::ConnectionClosed | FrameError::Io(_))
            | SessionError::Transport(TransportError::ConnectionLost(_) | TransportError::Closed)
    ) || err.is_protocol_violation()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_and_misbehaving_clients_do_not_stop_the_listener() {
        assert!(client_left(&SessionError::Frame(FrameError::ConnectionClosed)));
        assert!(client_left(&SessionError::Frame(FrameError::PayloadTooLarge {
            size: 2,
            max: 1
        })));
        assert!(!client_left(&SessionError::InvalidConfig("x".into())));
    }
}
