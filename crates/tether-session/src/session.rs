use std::cell::Cell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tether_frame::{
    encode_frame, Envelope, Frame, FrameError, FrameType, FrameWriter, Message, WireFormat,
};
use tether_transport::{Connector, DiscoveredServer, Link, TcpConnector};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::dispatch::{Dispatcher, NullDispatcher, TelemetrySource};
use crate::error::{Result, SessionError};
use crate::heartbeat::{heartbeat_frame, HeartbeatSequence};
use crate::state::{ConnectionState, StateCell};
use crate::stats::{Statistics, StatsSnapshot};
use crate::worker::{
    ExitReason, HeartbeatWorker, OutboundMessage, ReceiveWorker, SendWorker, WorkerExit,
    WorkerKind,
};

/// Longest a stop request waits before the control thread notices it.
const STOP_POLL: Duration = Duration::from_millis(100);

thread_local! {
    /// Address of the session whose control or worker thread this is. Zero elsewhere.
    static SESSION_THREAD: Cell<usize> = const { Cell::new(0) };
}

/// A reconnecting client session.
///
/// One control thread owns the connection lifecycle. While connected, three
/// workers share the link: one drains the FIFO send queue, one reads and
/// dispatches frames, one sends heartbeats and watches liveness.
pub struct Session {
    inner: Arc<Inner>,
    control: Mutex<Option<JoinHandle<()>>>,
    /// Held for all of `start` and across the join in `stop`.
    lifecycle: Mutex<()>,
}

struct Inner {
    config: Mutex<SessionConfig>,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<dyn Dispatcher>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    state: StateCell,
    stop: Arc<AtomicBool>,
    stats: Arc<Statistics>,
    sequence: Arc<HeartbeatSequence>,
    connection: Mutex<Option<LiveConnection>>,
}

/// What callers need from the current connection.
struct LiveConnection {
    queue: Sender<OutboundMessage>,
    local_addr: Option<SocketAddr>,
    client_id: String,
    max_payload_size: usize,
    wire_format: WireFormat,
}

/// Signal-safe stop request: sets a flag and nothing else.
///
/// This is also the way to stop a session from inside a [`Dispatcher`]
/// callback. The control thread notices the flag within one poll interval.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<dyn Dispatcher>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
}

impl SessionBuilder {
    /// Override the transport. Defaults to TCP.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn telemetry(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(source);
        self
    }

    pub fn build(self) -> Session {
        Session {
            inner: Arc::new(Inner {
                config: Mutex::new(self.config),
                connector: self.connector,
                dispatcher: self.dispatcher,
                telemetry: self.telemetry,
                state: StateCell::new(ConnectionState::Disconnected),
                stop: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(Statistics::new()),
                sequence: Arc::new(HeartbeatSequence::new()),
                connection: Mutex::new(None),
            }),
            control: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }
}

impl Session {
    /// TCP session delivering inbound frames to `dispatcher`.
    pub fn new(config: SessionConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::builder(config).dispatcher(dispatcher).build()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            connector: Arc::new(TcpConnector),
            dispatcher: Arc::new(NullDispatcher),
            telemetry: None,
        }
    }

    /// Start the control thread. A no-op while it is already running.
    ///
    /// After the session gave up (`Error`), this starts a fresh cycle.
    /// Called from one of this session's own threads, such as a dispatcher
    /// callback, it returns at once since the session is running.
    pub fn start(&self) -> Result<()> {
        if self.inner.on_own_thread() {
            return Ok(());
        }
        let _lifecycle = lock(&self.lifecycle);
        let mut control = lock(&self.control);
        if control.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("session already running");
            return Ok(());
        }
        if let Some(finished) = control.take() {
            join_logged(finished, "tether-control");
        }

        let config = lock(&self.inner.config).clone();
        config.validate()?;

        self.inner.stop.store(false, Ordering::SeqCst);
        self.inner.sequence.reset();

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("tether-control".to_string())
            .spawn(move || {
                inner.mark_current_thread();
                inner.run(config)
            })
            .map_err(|source| SessionError::Spawn {
                name: "tether-control",
                source,
            })?;
        *control = Some(handle);
        Ok(())
    }

    /// Stop and join everything. Ends in `Disconnected`. Safe to call twice.
    ///
    /// A concurrent [`start`](Self::start) waits until this returns. Called
    /// from one of this session's own threads, it only requests the stop like
    /// [`request_stop`](Self::request_stop), because those threads cannot
    /// join themselves.
    pub fn stop(&self) {
        if self.inner.on_own_thread() {
            debug!("stop requested from a session thread");
            self.request_stop();
            return;
        }
        let _lifecycle = lock(&self.lifecycle);
        self.inner.stop.store(true, Ordering::SeqCst);
        let handle = lock(&self.control).take();
        if let Some(handle) = handle {
            join_logged(handle, "tether-control");
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Ask the session to stop without waiting. Safe from a signal handler.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.inner.stop))
    }

    /// Queue an application message. Fire-and-forget.
    pub fn send_message(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(FrameType::Response, payload)
    }

    /// Queue a frame of an explicit kind.
    pub fn send_frame(&self, kind: FrameType, payload: impl Into<Bytes>) -> Result<()> {
        self.inner.enqueue(Frame::new(kind, payload))
    }

    /// Queue a frame and get a receiver that yields its wire size once the
    /// send worker has written it.
    ///
    /// The receiver disconnects without a value if the frame is dropped
    /// unsent, for example when the connection is lost first.
    pub fn send_frame_confirmed(
        &self,
        kind: FrameType,
        payload: impl Into<Bytes>,
    ) -> Result<Receiver<usize>> {
        let (delivered_tx, delivered_rx) = bounded(1);
        let message = OutboundMessage::new(Frame::new(kind, payload)).with_delivery(delivered_tx);
        self.inner.enqueue_message(message)?;
        Ok(delivered_rx)
    }

    /// Wrap `message` in an envelope stamped with this client's id and queue it.
    pub fn send_envelope(&self, message: &Message) -> Result<()> {
        let client_id = self.inner.with_connection(|live| live.client_id.clone())?;
        let frame = Envelope::new(client_id, message.clone()).into_frame()?;
        self.inner.enqueue(frame)
    }

    /// Queue a heartbeat now, outside the regular schedule.
    pub fn send_heartbeat(&self) -> Result<()> {
        let client_id = self.inner.with_connection(|live| live.client_id.clone())?;
        let frame = heartbeat_frame(&client_id, self.inner.sequence.next())?;
        self.inner.enqueue(frame)?;
        self.inner.stats.record_heartbeat_sent(Instant::now());
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the control thread is alive.
    pub fn is_running(&self) -> bool {
        lock(&self.control)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(Instant::now())
    }

    /// Rough round-trip estimate from heartbeat timing. `None` unless connected.
    pub fn ping_estimate(&self) -> Option<Duration> {
        if !self.is_connected() {
            return None;
        }
        self.inner.stats.ping_estimate(Instant::now())
    }

    /// Local address of the current connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.connection)
            .as_ref()
            .and_then(|live| live.local_addr)
    }

    pub fn config(&self) -> SessionConfig {
        lock(&self.inner.config).clone()
    }

    /// Replace the configuration. Only allowed while stopped.
    pub fn set_config(&self, config: SessionConfig) -> Result<()> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }
        config.validate()?;
        *lock(&self.inner.config) = config;
        Ok(())
    }

    /// Point the next start at a different controller.
    pub fn set_target(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let config = SessionConfig {
            host: host.into(),
            port,
            ..self.config()
        };
        self.set_config(config)
    }

    /// Target the first discovered controller and start.
    pub fn connect_to_discovered(&self, servers: &[DiscoveredServer]) -> Result<()> {
        let first = servers.first().ok_or_else(|| {
            SessionError::InvalidConfig("no discovered controllers".to_string())
        })?;
        let port = lock(&self.inner.config).port;
        self.set_target(first.address.to_string(), port)?;
        info!(address = %first.address, port, "using discovered controller");
        self.start()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How one connected period ended.
enum ConnectionEnd {
    Stopped,
    Lost(SessionError),
}

impl Inner {
    fn token(&self) -> usize {
        self as *const Self as usize
    }

    fn mark_current_thread(&self) {
        mark_session_thread(self.token());
    }

    fn on_own_thread(&self) -> bool {
        SESSION_THREAD.with(|current| current.get() == self.token())
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.replace(state);
        if previous == state {
            return;
        }
        info!(from = %previous, to = %state, "connection state changed");
        if state == ConnectionState::Connected {
            self.dispatcher.on_connection_state_changed(true);
        } else if previous == ConnectionState::Connected {
            self.dispatcher.on_connection_state_changed(false);
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&LiveConnection) -> T) -> Result<T> {
        if self.state.get() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        lock(&self.connection)
            .as_ref()
            .map(f)
            .ok_or(SessionError::NotConnected)
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        self.enqueue_message(OutboundMessage::new(frame))
    }

    fn enqueue_message(&self, message: OutboundMessage) -> Result<()> {
        let frame = &message.frame;
        let guard = lock(&self.connection);
        let live = match guard.as_ref() {
            Some(live) if self.state.get() == ConnectionState::Connected => live,
            _ => return Err(SessionError::NotConnected),
        };

        if frame.payload.len() > live.max_payload_size {
            warn!(
                size = frame.payload.len(),
                max = live.max_payload_size,
                "rejecting oversized outbound message"
            );
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: live.max_payload_size,
            }
            .into());
        }
        if live.wire_format == WireFormat::LineDelimited {
            // Validate framing now so the send worker never sees a bad record.
            let mut scratch = bytes::BytesMut::new();
            encode_frame(live.wire_format, frame, &mut scratch)?;
        }

        live.queue
            .send(message)
            .map_err(|_| SessionError::NotConnected)
    }

    /// Control loop: connect, serve, and reconnect until stopped or out of attempts.
    fn run(self: Arc<Self>, config: SessionConfig) {
        let mut failures: u32 = 0;

        while !self.stopping() {
            self.set_state(ConnectionState::Connecting);

            match self.establish(&config) {
                Ok(link) => {
                    failures = 0;
                    match self.serve(&config, link) {
                        ConnectionEnd::Stopped => break,
                        ConnectionEnd::Lost(err) => {
                            warn!(error = %err, "connection lost");
                            self.dispatcher.on_error(&err);
                        }
                    }
                }
                Err(err) => {
                    warn!(host = %config.host, port = config.port, error = %err, "connect failed");
                    self.dispatcher.on_error(&err);
                }
            }

            if self.stopping() {
                break;
            }

            failures = failures.saturating_add(1);
            if config
                .max_reconnect_attempts
                .is_some_and(|max| failures >= max)
            {
                error!(attempts = failures, "maximum reconnection attempts reached");
                self.set_state(ConnectionState::Error);
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            info!(delay = ?config.reconnect_delay, attempt = failures, "reconnecting");
            if !self.pause(config.reconnect_delay) {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Sleep for `delay` unless a stop is requested. Returns false on stop.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.stopping() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(STOP_POLL));
        }
    }

    /// Connect and, if configured, greet the controller before any worker runs.
    fn establish(&self, config: &SessionConfig) -> Result<Arc<dyn Link>> {
        let link = self
            .connector
            .connect(&config.host, config.port, &config.link_options())?;
        self.stats.reset(Instant::now());

        if config.send_handshake {
            let greeting = Envelope::new(&config.client_id, Message::handshake(&config.client_id))
                .into_frame()
                .and_then(|frame| {
                    FrameWriter::for_link(Arc::clone(&link), config.frame_config())
                        .write_frame(&frame)
                });
            match greeting {
                Ok(written) => {
                    self.stats.record_sent(written);
                    debug!(bytes = written, "handshake sent");
                }
                Err(err) => {
                    link.close();
                    return Err(err.into());
                }
            }
        }

        Ok(link)
    }

    /// Run the workers for one connection and tear it down when any of them ends.
    fn serve(&self, config: &SessionConfig, link: Arc<dyn Link>) -> ConnectionEnd {
        let (halt_tx, halt_rx) = bounded::<()>(0);
        let (queue_tx, queue_rx) = unbounded::<OutboundMessage>();
        let (exit_tx, exit_rx) = unbounded::<WorkerExit>();

        *lock(&self.connection) = Some(LiveConnection {
            queue: queue_tx.clone(),
            local_addr: link.local_addr(),
            client_id: config.client_id.clone(),
            max_payload_size: config.max_payload_size,
            wire_format: config.wire_format,
        });
        self.set_state(ConnectionState::Connected);

        let send = SendWorker {
            link: Arc::clone(&link),
            frame_config: config.frame_config(),
            queue: queue_rx,
            halt: halt_rx.clone(),
            stats: Arc::clone(&self.stats),
            exits: exit_tx.clone(),
        };
        let receive = ReceiveWorker {
            link: Arc::clone(&link),
            frame_config: config.frame_config(),
            dispatcher: Arc::clone(&self.dispatcher),
            stats: Arc::clone(&self.stats),
            exits: exit_tx.clone(),
        };
        let heartbeat = HeartbeatWorker {
            client_id: config.client_id.clone(),
            interval: config.heartbeat_interval,
            liveness_window: config.liveness_window(),
            telemetry_interval: config.telemetry_interval,
            telemetry: self.telemetry.clone(),
            sequence: Arc::clone(&self.sequence),
            queue: queue_tx,
            halt: halt_rx,
            stats: Arc::clone(&self.stats),
            exits: exit_tx,
        };

        let token = self.token();
        let mut workers = Vec::with_capacity(3);
        let mut spawn_failure = None;
        for (kind, job) in [
            (WorkerKind::Send, Job::Send(send)),
            (WorkerKind::Receive, Job::Receive(receive)),
            (WorkerKind::Heartbeat, Job::Heartbeat(heartbeat)),
        ] {
            match thread::Builder::new()
                .name(kind.thread_name().to_string())
                .spawn(move || {
                    mark_session_thread(token);
                    job.run()
                })
            {
                Ok(handle) => workers.push((kind, handle)),
                Err(source) => {
                    spawn_failure = Some(SessionError::Spawn {
                        name: kind.thread_name(),
                        source,
                    });
                    break;
                }
            }
        }

        let end = match spawn_failure {
            Some(err) => ConnectionEnd::Lost(err),
            None => loop {
                match exit_rx.recv_timeout(STOP_POLL) {
                    Ok(WorkerExit { worker, reason }) => {
                        debug!(%worker, "worker ended first");
                        break match reason {
                            ExitReason::Failed(err) => ConnectionEnd::Lost(err),
                            ExitReason::Halted if self.stopping() => ConnectionEnd::Stopped,
                            ExitReason::Halted => ConnectionEnd::Lost(SessionError::NotConnected),
                        };
                    }
                    Err(RecvTimeoutError::Timeout) if self.stopping() => {
                        break ConnectionEnd::Stopped
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        break ConnectionEnd::Lost(SessionError::NotConnected)
                    }
                }
            },
        };

        self.connection_lost(link, halt_tx, workers);
        end
    }

    /// Close the link, wake every worker and join them.
    fn connection_lost(
        &self,
        link: Arc<dyn Link>,
        halt: Sender<()>,
        workers: Vec<(WorkerKind, JoinHandle<()>)>,
    ) {
        lock(&self.connection).take();
        link.close();
        drop(halt);
        for (kind, handle) in workers {
            join_logged(handle, kind.thread_name());
        }
        debug!("connection torn down");
    }
}

enum Job {
    Send(SendWorker),
    Receive(ReceiveWorker),
    Heartbeat(HeartbeatWorker),
}

impl Job {
    fn run(self) {
        match self {
            Self::Send(worker) => worker.run(),
            Self::Receive(worker) => worker.run(),
            Self::Heartbeat(worker) => worker.run(),
        }
    }
}

fn mark_session_thread(token: usize) {
    SESSION_THREAD.with(|current| current.set(token));
}

fn join_logged(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        error!(thread = name, "thread panicked");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
