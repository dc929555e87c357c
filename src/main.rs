mod app;
mod error;
mod manager;
mod models;
mod worker;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use app::{cli::Cli, signals::TerminationSignals, supervisor::Supervisor};
use models::message::Shutdown;

/// Exit status when the supervisor cannot start.
const FAILURE: u8 = 111;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(FAILURE)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // Before any thread exists, so every thread inherits the mask.
    let signals = TerminationSignals::block().context("failed to block termination signals")?;

    let supervisor = Supervisor::start(cli.into_config())?;
    signals
        .forward(supervisor.trigger())
        .context("failed to start signal forwarder")?;

    if let Some(addr) = supervisor.local_addr() {
        info!("control protocol listening on {}", addr);
    }

    match supervisor.wait() {
        Shutdown::Signal(signal) => info!("received signal {}, shutting down", signal),
        Shutdown::Command => info!("exit command received, shutting down"),
    }
    supervisor.shutdown();
    info!("{}", supervisor.service().status());
    info!("{}", supervisor.logger().status());

    Ok(())
}
