use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tether_transport::DiscoveryResponder;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, RespondArgs};
use crate::exit::{transport_error, CliResult, SUCCESS};

pub fn run(args: RespondArgs) -> CliResult<i32> {
    let responder = DiscoveryResponder::bind(args.addr)
        .map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let answered = responder
        .run(&running)
        .map_err(|err| transport_error("responder failed", err))?;
    info!(answered, "discovery responder stopped");
    Ok(SUCCESS)
}
