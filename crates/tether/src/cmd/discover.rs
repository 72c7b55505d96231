use tether_transport::{discover_servers, DiscoveryConfig};
use tracing::info;

use crate::cmd::{parse_duration, DiscoverArgs};
use crate::exit::{transport_error, CliResult, SUCCESS};
use crate::output::{print_servers, OutputFormat};

pub fn run(args: DiscoverArgs, format: OutputFormat) -> CliResult<i32> {
    let config = DiscoveryConfig::default()
        .with_port(args.port)
        .with_timeout(parse_duration(&args.timeout)?)
        .with_broadcast_addr(args.broadcast)
        .with_shuffle(args.shuffle);

    let servers =
        discover_servers(&config).map_err(|err| transport_error("discovery failed", err))?;
    info!(count = servers.len(), "discovery finished");
    print_servers(&servers, format);
    Ok(SUCCESS)
}
