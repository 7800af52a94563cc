//! brickflow CLI: control peer for brick pipelines.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use brickflow::{CliArgs, Config, ControlPeer, cancel_on_signal, init_metrics, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let paths = args.config_paths();
    if paths.is_empty() {
        eprintln!("Error: no config files or directories specified");
        return ExitCode::FAILURE;
    }

    info!("Loading config from {} source(s)", paths.len());

    let config = match Config::from_paths(&paths) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    for flow in &config.flows {
        info!("  Flow: {} ({})", flow.name, flow.chain.join(" -> "));
    }

    if args.check {
        println!("Configuration OK: {} flow(s)", config.flows.len());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_metrics(&config.metrics.address) {
        eprintln!("Failed to start metrics server: {e}");
        return ExitCode::FAILURE;
    }

    let peer = match ControlPeer::from_config(&config) {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            eprintln!("Failed to build control peer: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Starting brickflow control peer with {} flow(s)",
        config.flows.len()
    );

    let shutdown = CancellationToken::new();
    let _signal = cancel_on_signal(shutdown.clone());

    match peer.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Control peer failed: {e}");
            ExitCode::FAILURE
        }
    }
}
