use clap::{Args, Subcommand, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_frame::{FrameType, WireFormat};
use tether_session::SessionConfig;

use crate::exit::{CliError, CliResult, CONFIG_INVALID, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod connect;
pub mod discover;
pub mod listen;
pub mod respond;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a reconnecting session and print inbound frames.
    Connect(ConnectArgs),
    /// Connect, send a single message and optionally wait for a reply.
    Send(SendArgs),
    /// Broadcast a discovery request and list the controllers that answer.
    Discover(DiscoverArgs),
    /// Accept clients, acknowledge heartbeats and print their frames.
    Listen(ListenArgs),
    /// Answer discovery broadcasts.
    Respond(RespondArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Connect(args) => connect::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Discover(args) => discover::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Respond(args) => respond::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum WireFormatArg {
    /// Newline-delimited JSON records.
    Line,
    /// `[type u32 LE][len u64 LE][payload]`.
    Binary,
}

impl From<WireFormatArg> for WireFormat {
    fn from(arg: WireFormatArg) -> Self {
        match arg {
            WireFormatArg::Line => WireFormat::LineDelimited,
            WireFormatArg::Binary => WireFormat::LengthPrefixed,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Command,
    Response,
    Error,
    Telemetry,
}

impl From<KindArg> for FrameType {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Command => FrameType::Command,
            KindArg::Response => FrameType::Response,
            KindArg::Error => FrameType::Error,
            KindArg::Telemetry => FrameType::Telemetry,
        }
    }
}

/// Where to connect and how. Flags override values loaded from `--config`.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Controller host name or address.
    pub host: Option<String>,
    /// Controller port.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
    /// JSON session configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Wire format.
    #[arg(long, value_name = "FORMAT")]
    pub wire_format: Option<WireFormatArg>,
    /// Identifier stamped on outbound envelopes.
    #[arg(long)]
    pub client_id: Option<String>,
    /// Connect timeout (e.g. 5s, 500ms).
    #[arg(long)]
    pub connect_timeout: Option<String>,
    /// Pause between connection attempts (e.g. 30s).
    #[arg(long)]
    pub reconnect_delay: Option<String>,
    /// Give up after N consecutive failures; -1 retries forever.
    #[arg(long, allow_negative_numbers = true)]
    pub max_attempts: Option<i64>,
    /// Heartbeat interval (e.g. 30s).
    #[arg(long)]
    pub heartbeat: Option<String>,
    /// Do not send a handshake after connecting.
    #[arg(long)]
    pub no_handshake: bool,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Find the controller by UDP broadcast instead of using the host argument.
    #[arg(long, conflicts_with = "host")]
    pub discover: bool,
    /// Discovery port used with --discover.
    #[arg(long, default_value_t = tether_transport::discovery::DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,
    /// Stop after receiving N frames.
    #[arg(long)]
    pub count: Option<usize>,
    /// Print traffic statistics on exit.
    #[arg(long)]
    pub stats: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Frame type to send.
    #[arg(long = "type", short = 't', value_name = "TYPE", default_value = "response")]
    pub kind: KindArg,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Wait for one response frame and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the connection, delivery and any response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// UDP port to broadcast to.
    #[arg(long, short = 'p', default_value_t = tether_transport::discovery::DEFAULT_DISCOVERY_PORT)]
    pub port: u16,
    /// How long to collect answers (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Destination address of the request.
    #[arg(long, default_value = "255.255.255.255")]
    pub broadcast: IpAddr,
    /// Shuffle the candidates.
    #[arg(long)]
    pub shuffle: bool,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind.
    #[arg(default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,
    /// Wire format.
    #[arg(long, value_name = "FORMAT", default_value = "line")]
    pub wire_format: WireFormatArg,
    /// Do not acknowledge heartbeats.
    #[arg(long)]
    pub no_ack: bool,
    /// Do not print heartbeats and handshakes.
    #[arg(long)]
    pub quiet: bool,
    /// Exit after printing N frames.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct RespondArgs {
    /// Address to bind.
    #[arg(default_value = "0.0.0.0:5555")]
    pub addr: SocketAddr,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Load `--config` (if any) and apply the command-line overrides on top.
pub fn session_config(args: &TargetArgs) -> CliResult<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|err| {
                crate::exit::io_error(&format!("failed reading {}", path.display()), err)
            })?;
            serde_json::from_str::<SessionConfig>(&text).map_err(|err| {
                CliError::new(
                    CONFIG_INVALID,
                    format!("invalid config {}: {err}", path.display()),
                )
            })?
        }
        None => SessionConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(wire_format) = args.wire_format {
        config.wire_format = wire_format.into();
    }
    if let Some(client_id) = &args.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(timeout) = &args.connect_timeout {
        config.connect_timeout = parse_duration(timeout)?;
    }
    if let Some(delay) = &args.reconnect_delay {
        config.reconnect_delay = parse_duration(delay)?;
    }
    if let Some(interval) = &args.heartbeat {
        config.heartbeat_interval = parse_duration(interval)?;
    }
    if let Some(max) = args.max_attempts {
        config.max_reconnect_attempts = parse_attempts(max)?;
    }
    if args.no_handshake {
        config.send_handshake = false;
    }

    config
        .validate()
        .map_err(|err| CliError::new(CONFIG_INVALID, err.to_string()))?;
    Ok(config)
}

fn parse_attempts(value: i64) -> CliResult<Option<u32>> {
    if value == -1 {
        return Ok(None);
    }
    match u32::try_from(value) {
        Ok(0) | Err(_) => Err(CliError::new(
            USAGE,
            format!("--max-attempts must be positive or -1, got {value}"),
        )),
        Ok(max) => Ok(Some(max)),
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

/// Clear `running` on Ctrl-C.
pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
