use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether_frame::Frame;
use tether_session::{ConnectionState, Dispatcher, Session, SessionError};
use tether_transport::{discover_servers, DiscoveryConfig};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, session_config, ConnectArgs};
use crate::exit::{session_error, transport_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_frame, print_stats, OutputFormat};

const POLL: Duration = Duration::from_millis(100);

/// Prints every inbound frame and raises `done` after `limit` of them.
struct PrintDispatcher {
    peer: String,
    format: OutputFormat,
    printed: AtomicUsize,
    limit: Option<usize>,
    done: Arc<AtomicBool>,
}

impl Dispatcher for PrintDispatcher {
    fn on_message(&self, frame: &Frame) {
        if self.limit.is_some_and(|limit| self.printed.load(Ordering::SeqCst) >= limit) {
            return;
        }
        print_frame(frame, &self.peer, self.format);
        let printed = self.printed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit.is_some_and(|limit| printed >= limit) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    fn on_connection_state_changed(&self, connected: bool) {
        if connected {
            info!(peer = %self.peer, "connected");
        } else {
            info!(peer = %self.peer, "disconnected");
        }
    }

    fn on_error(&self, error: &SessionError) {
        warn!(peer = %self.peer, %error, "session error");
    }
}

pub fn run(args: ConnectArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = session_config(&args.target)?;

    if args.discover {
        let discovery = DiscoveryConfig::default().with_port(args.discovery_port);
        let servers =
            discover_servers(&discovery).map_err(|err| transport_error("discovery failed", err))?;
        // Never empty: discovery falls back to loopback.
        if let Some(first) = servers.first() {
            config.host = first.address.to_string();
        }
    }

    let peer = format!("{}:{}", config.host, config.port);
    let done = Arc::new(AtomicBool::new(false));
    let dispatcher = Arc::new(PrintDispatcher {
        peer,
        format,
        printed: AtomicUsize::new(0),
        limit: args.count,
        done: done.clone(),
    });
    let session = Session::builder(config).dispatcher(dispatcher).build();

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    session
        .start()
        .map_err(|err| session_error("start failed", err))?;

    let final_state = loop {
        if !session.is_running() {
            break session.state();
        }
        if !running.load(Ordering::SeqCst) || done.load(Ordering::SeqCst) {
            session.request_stop();
        }
        thread::sleep(POLL);
    };
    let stats = session.stats();
    session.stop();

    if args.stats {
        print_stats(&stats, format);
    }

    if final_state == ConnectionState::Error {
        return Err(CliError::new(
            FAILURE,
            "gave up: maximum reconnection attempts reached",
        ));
    }
    Ok(SUCCESS)
}
