// ABOUTME: Final system teardown for halt, poweroff, and reboot.
// ABOUTME: Stops services, syncs, unmounts, then hands the machine to the kernel.

use rustix::mount::{unmount, UnmountFlags};
use rustix::system::{reboot, RebootCommand};
use tracing::{error, info, warn};

use crate::runlevel::{ServiceControl, ShutdownKind};
use crate::service::ServiceManager;

const UNMOUNT_ORDER: &[&str] = &["/run", "/tmp", "/dev/pts", "/dev", "/sys", "/proc"];

impl ShutdownKind {
    fn kernel_command(self) -> RebootCommand {
        match self {
            ShutdownKind::Halt => RebootCommand::Halt,
            ShutdownKind::Poweroff => RebootCommand::PowerOff,
            ShutdownKind::Reboot => RebootCommand::Restart,
        }
    }
}

/// Tear the system down and invoke the kernel. Never returns; if the
/// kernel call fails, PID 1 parks instead of exiting.
pub fn perform(kind: ShutdownKind, manager: &mut ServiceManager) -> ! {
    info!(command = %kind, "beginning system teardown");

    manager.stop_all();

    rustix::fs::sync();
    unmount_filesystems();
    rustix::fs::sync();

    info!(command = %kind, "asking the kernel to finish");
    if let Err(e) = reboot(kind.kernel_command()) {
        error!(error = %e, "reboot syscall failed");
    }

    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

fn unmount_filesystems() {
    for target in UNMOUNT_ORDER {
        match unmount(*target, UnmountFlags::DETACH) {
            Ok(()) => info!(target = target, "unmounted"),
            Err(e) => warn!(target = target, error = %e, "unmount failed"),
        }
    }
}
