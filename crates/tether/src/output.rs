use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use tether_frame::Frame;
use tether_session::StatsSnapshot;
use tether_transport::DiscoveredServer;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    kind: &'static str,
    kind_id: u32,
    payload_size: usize,
    payload: String,
    peer: &'a str,
}

pub fn print_frame(frame: &Frame, peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                kind: frame.kind.name(),
                kind_id: frame.kind.as_u32(),
                payload_size: frame.payload.len(),
                payload: payload_preview(frame.payload.as_ref()),
                peer,
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TYPE", "SIZE", "PEER", "PAYLOAD"])
                .add_row(vec![
                    frame.kind.name().to_string(),
                    frame.payload.len().to_string(),
                    peer.to_string(),
                    payload_preview(frame.payload.as_ref()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "type={} size={} peer={} payload={}",
                frame.kind,
                frame.payload.len(),
                peer,
                payload_preview(frame.payload.as_ref())
            );
        }
        OutputFormat::Raw => {
            print_raw(frame.payload.as_ref());
            print_raw(b"\n");
        }
    }
}

pub fn print_servers(servers: &[DiscoveredServer], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&servers),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "ADDRESS"]);
            for (index, server) in servers.iter().enumerate() {
                table.add_row(vec![(index + 1).to_string(), server.address.to_string()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for server in servers {
                println!("{}", server.address);
            }
        }
    }
}

pub fn print_stats(stats: &StatsSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(stats),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["STAT", "VALUE"]);
            for (name, value) in stats_rows(stats) {
                table.add_row(vec![name.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (name, value) in stats_rows(stats) {
                println!("{name}: {value}");
            }
        }
    }
}

fn stats_rows(stats: &StatsSnapshot) -> Vec<(&'static str, String)> {
    let optional = |value: Option<u64>| value.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
    vec![
        ("bytes_sent", stats.bytes_sent.to_string()),
        ("bytes_received", stats.bytes_received.to_string()),
        ("messages_sent", stats.messages_sent.to_string()),
        ("messages_received", stats.messages_received.to_string()),
        ("connection_duration", optional(stats.connection_duration_ms)),
        ("since_heartbeat_sent", optional(stats.since_heartbeat_sent_ms)),
        (
            "since_heartbeat_received",
            optional(stats.since_heartbeat_received_ms),
        ),
    ]
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}
