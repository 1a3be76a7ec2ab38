//! systemd-echo: an echo server (RFC 862) for systemd
//!
//! Serves TCP and UDP echo from a single-threaded mio event loop.
//!
//! Features:
//! - Socket activation (one stream and one datagram socket)
//! - `READY=1` on startup and `WATCHDOG=1` heartbeats
//! - SIGHUP reloads the backlog from the configuration file
//! - SIGTERM exits immediately with success

mod config;
mod runtime;

use clap::Parser;
use config::CliArgs;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        config = %cli.config.display(),
        listen = %cli.listen,
        "Starting systemd-echo"
    );

    match runtime::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
