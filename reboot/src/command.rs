// ABOUTME: Control-command resolution and dispatch.
// ABOUTME: Maps invocation identity and flags to a command, then signals init or calls the kernel.

use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rustix::system::RebootCommand;
use tracing::warn;

/// A fully resolved external control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Reboot,
    Halt,
    Poweroff,
    Suspend,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Reboot => "reboot",
            CommandKind::Halt => "halt",
            CommandKind::Poweroff => "poweroff",
            CommandKind::Suspend => "suspend",
        };
        f.write_str(name)
    }
}

impl CommandKind {
    /// The kernel command used on the forced path.
    pub fn kernel_command(self) -> RebootCommand {
        match self {
            CommandKind::Reboot => RebootCommand::Restart,
            CommandKind::Halt => RebootCommand::Halt,
            CommandKind::Poweroff => RebootCommand::PowerOff,
            CommandKind::Suspend => RebootCommand::SwSuspend,
        }
    }

    /// The signal that asks PID 1 to perform this command. Suspend has no
    /// in-band request to init.
    pub fn init_signal(self) -> Option<Signal> {
        match self {
            CommandKind::Reboot => Some(Signal::SIGTERM),
            CommandKind::Halt => Some(Signal::SIGUSR1),
            CommandKind::Poweroff => Some(Signal::SIGUSR2),
            CommandKind::Suspend => None,
        }
    }
}

/// Resolve the command from the invoking binary name, then let an explicit
/// flag override it. The identity is passed in rather than re-read from the
/// OS so resolution stays a pure function.
pub fn resolve(identity: &str, explicit: Option<CommandKind>) -> CommandKind {
    let from_identity = match identity {
        "halt" | "shutdown" => CommandKind::Halt,
        "poweroff" => CommandKind::Poweroff,
        "suspend" => CommandKind::Suspend,
        _ => CommandKind::Reboot,
    };
    explicit.unwrap_or(from_identity)
}

/// Carry out a resolved command.
///
/// Forced commands go to the kernel directly, bypassing init: nothing is
/// stopped cleanly and no session record is written. A failed forced call
/// falls through to the normal signal path instead of aborting.
pub fn dispatch(kind: CommandKind, forced: bool) -> Result<()> {
    if forced {
        match rustix::system::reboot(kind.kernel_command()) {
            // Suspend is the only kind where the call returns on success.
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(command = %kind, error = %e, "forced command failed, falling back to init");
            }
        }
    }
    request_from_init(kind)
}

fn request_from_init(kind: CommandKind) -> Result<()> {
    let Some(signal) = kind.init_signal() else {
        bail!("invalid command: init accepts no {kind} request");
    };

    kill(Pid::from_raw(1), signal).context("failed to signal init")?;

    // Delivery only proves the signal reached init, not that init acted on
    // it. The pause is a heuristic, not a synchronization point.
    thread::sleep(Duration::from_secs(2));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_selects_the_default_command() {
        assert_eq!(resolve("halt", None), CommandKind::Halt);
        assert_eq!(resolve("shutdown", None), CommandKind::Halt);
        assert_eq!(resolve("poweroff", None), CommandKind::Poweroff);
        assert_eq!(resolve("suspend", None), CommandKind::Suspend);
        assert_eq!(resolve("reboot", None), CommandKind::Reboot);
        assert_eq!(resolve("anything-else", None), CommandKind::Reboot);
    }

    #[test]
    fn explicit_flag_overrides_identity() {
        assert_eq!(
            resolve("halt", Some(CommandKind::Poweroff)),
            CommandKind::Poweroff
        );
        assert_eq!(
            resolve("suspend", Some(CommandKind::Reboot)),
            CommandKind::Reboot
        );
        assert_eq!(
            resolve("reboot", Some(CommandKind::Halt)),
            CommandKind::Halt
        );
    }

    #[test]
    fn each_command_maps_to_a_distinct_init_signal() {
        assert_eq!(CommandKind::Reboot.init_signal(), Some(Signal::SIGTERM));
        assert_eq!(CommandKind::Halt.init_signal(), Some(Signal::SIGUSR1));
        assert_eq!(CommandKind::Poweroff.init_signal(), Some(Signal::SIGUSR2));
    }

    #[test]
    fn suspend_has_no_init_signal() {
        assert_eq!(CommandKind::Suspend.init_signal(), None);
    }

    #[test]
    fn kernel_commands_cover_every_kind() {
        assert!(matches!(
            CommandKind::Reboot.kernel_command(),
            RebootCommand::Restart
        ));
        assert!(matches!(
            CommandKind::Halt.kernel_command(),
            RebootCommand::Halt
        ));
        assert!(matches!(
            CommandKind::Poweroff.kernel_command(),
            RebootCommand::PowerOff
        ));
        assert!(matches!(
            CommandKind::Suspend.kernel_command(),
            RebootCommand::SwSuspend
        ));
    }
}
