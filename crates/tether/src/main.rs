mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Reconnecting TCP session client")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "tether",
            "send",
            "127.0.0.1",
            "--port",
            "9000",
            "--type",
            "command",
            "--data",
            "hello",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.target.host.as_deref(), Some("127.0.0.1"));
                assert_eq!(args.target.port, Some(9000));
                assert_eq!(args.kind, cmd::KindArg::Command);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "tether",
            "send",
            "localhost",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn connect_accepts_unlimited_attempts() {
        let cli = Cli::try_parse_from([
            "tether",
            "connect",
            "controller.local",
            "--max-attempts",
            "-1",
            "--wire-format",
            "binary",
            "--reconnect-delay",
            "500ms",
        ])
        .expect("connect args should parse");

        match cli.command {
            Command::Connect(args) => {
                assert_eq!(args.target.max_attempts, Some(-1));
                assert_eq!(args.target.wire_format, Some(cmd::WireFormatArg::Binary));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn connect_discover_conflicts_with_host() {
        let err = Cli::try_parse_from(["tether", "connect", "10.0.0.1", "--discover"])
            .expect_err("host and --discover should conflict");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn listen_and_respond_have_default_addresses() {
        let cli = Cli::try_parse_from(["tether", "listen"]).expect("listen should parse");
        assert!(matches!(cli.command, Command::Listen(ref args) if args.addr.port() == 8080));

        let cli = Cli::try_parse_from(["tether", "respond"]).expect("respond should parse");
        assert!(matches!(cli.command, Command::Respond(ref args) if args.addr.port() == 5555));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tether", "discover", "--format", "json", "--timeout", "1s"])
            .expect("discover args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Discover(_)));
    }
}
