// ABOUTME: Primus watchdog guard daemon.
// ABOUTME: Owns the hardware watchdog until shutdown or a successor takes over.

mod device;
mod guard;
mod logging;
mod signals;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::device::HardwareWatchdog;
use crate::guard::Guard;
use crate::signals::GuardSignals;

#[derive(Parser)]
#[command(name = "watchdogd", about = "Primus hardware watchdog guard")]
struct Args {
    /// Watchdog device node.
    #[arg(long, default_value = "/dev/watchdog")]
    device: PathBuf,

    /// Device timeout in seconds; the refresh period is half of it.
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(2..=3600))]
    timeout: u32,
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();

    let signals = GuardSignals::register().context("failed to install signal handlers")?;

    // A guard that cannot reach its device cannot honor its contract;
    // that is fatal, not retryable.
    let device = HardwareWatchdog::open(&args.device)?;
    let mut guard = Guard::new(device, args.timeout)?;

    match primus_notify::notify(false, "READY=1") {
        Ok(primus_notify::Delivery::Delivered) => info!("announced readiness"),
        Ok(primus_notify::Delivery::NotConfigured) => {}
        Err(e) => warn!(error = %e, "readiness notification failed"),
    }

    guard.run(&signals);

    if let Err(e) = primus_notify::notify(false, "STOPPING=1") {
        warn!(error = %e, "stop notification failed");
    }

    info!("watchdog handed over, exiting");
    Ok(())
}
