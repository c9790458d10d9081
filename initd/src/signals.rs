// ABOUTME: Signal handling for PID 1.
// ABOUTME: Control commands, child exits, and reloads arrive as atomic flags only.

use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::runlevel::ShutdownKind;

/// Flags written by the handlers and drained by the main loop. A flag
/// means "at least one such signal arrived since the last check"; rapid
/// repeats coalesce and are never counted.
pub struct InitSignals {
    pub reboot_requested: Arc<AtomicBool>,
    pub halt_requested: Arc<AtomicBool>,
    pub poweroff_requested: Arc<AtomicBool>,
    pub child_exited: Arc<AtomicBool>,
    pub reload_requested: Arc<AtomicBool>,
}

impl InitSignals {
    pub fn register() -> std::io::Result<Self> {
        let reboot_requested = Arc::new(AtomicBool::new(false));
        let halt_requested = Arc::new(AtomicBool::new(false));
        let poweroff_requested = Arc::new(AtomicBool::new(false));
        let child_exited = Arc::new(AtomicBool::new(false));
        let reload_requested = Arc::new(AtomicBool::new(false));

        // SIGTERM is the reboot request; SIGINT covers ctrl-alt-del, which
        // the kernel forwards to PID 1 as the same request.
        signal_hook::flag::register(SIGTERM, Arc::clone(&reboot_requested))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&reboot_requested))?;
        signal_hook::flag::register(SIGUSR1, Arc::clone(&halt_requested))?;
        signal_hook::flag::register(SIGUSR2, Arc::clone(&poweroff_requested))?;
        signal_hook::flag::register(SIGCHLD, Arc::clone(&child_exited))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&reload_requested))?;

        Ok(Self {
            reboot_requested,
            halt_requested,
            poweroff_requested,
            child_exited,
            reload_requested,
        })
    }

    #[cfg(test)]
    pub fn unregistered() -> Self {
        Self {
            reboot_requested: Arc::new(AtomicBool::new(false)),
            halt_requested: Arc::new(AtomicBool::new(false)),
            poweroff_requested: Arc::new(AtomicBool::new(false)),
            child_exited: Arc::new(AtomicBool::new(false)),
            reload_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn take_child_exited(&self) -> bool {
        self.child_exited.swap(false, Ordering::Relaxed)
    }

    pub fn take_reload_requested(&self) -> bool {
        self.reload_requested.swap(false, Ordering::Relaxed)
    }

    /// Consume any pending control command. When several distinct commands
    /// raced in before this check, the most drastic one wins: poweroff
    /// over halt over reboot.
    pub fn take_shutdown_command(&self) -> Option<ShutdownKind> {
        let poweroff = self.poweroff_requested.swap(false, Ordering::Relaxed);
        let halt = self.halt_requested.swap(false, Ordering::Relaxed);
        let reboot = self.reboot_requested.swap(false, Ordering::Relaxed);

        if poweroff {
            Some(ShutdownKind::Poweroff)
        } else if halt {
            Some(ShutdownKind::Halt)
        } else if reboot {
            Some(ShutdownKind::Reboot)
        } else {
            None
        }
    }
}
