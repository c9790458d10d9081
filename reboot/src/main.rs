// ABOUTME: Command-line entry point for reboot/halt/shutdown/poweroff/suspend.
// ABOUTME: The binary name picks the default; flags override; --force skips init.

mod command;

use clap::Parser;
use tracing::info;

use crate::command::{dispatch, resolve, CommandKind};

#[derive(Parser)]
#[command(
    name = "reboot",
    about = "Ask init to reboot, halt, or power off the system"
)]
struct Args {
    /// Halt the system.
    #[arg(long, conflicts_with_all = ["poweroff", "reboot"])]
    halt: bool,

    /// Power the system off.
    #[arg(long, conflicts_with = "reboot")]
    poweroff: bool,

    /// Reboot the system.
    #[arg(long)]
    reboot: bool,

    /// Ask the kernel directly, bypassing init. Nothing is shut down
    /// cleanly on this path.
    #[arg(short = 'f', long)]
    force: bool,
}

impl Args {
    fn explicit_command(&self) -> Option<CommandKind> {
        if self.halt {
            Some(CommandKind::Halt)
        } else if self.poweroff {
            Some(CommandKind::Poweroff)
        } else if self.reboot {
            Some(CommandKind::Reboot)
        } else {
            None
        }
    }
}

/// Basename of the binary we were invoked as.
fn invocation_identity() -> String {
    std::env::args_os()
        .next()
        .map(std::path::PathBuf::from)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let kind = resolve(&invocation_identity(), args.explicit_command());

    info!(command = %kind, forced = args.force, "dispatching");
    dispatch(kind, args.force)
}
