// ABOUTME: Watchdog device access.
// ABOUTME: Trait over the ioctl surface plus the /dev/watchdog implementation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::libc::c_int;

/// The operations the guard needs from a watchdog device.
///
/// One device has exactly one session; whoever holds the handle is
/// responsible for feeding it until handover or reset.
pub trait WatchdogDevice {
    /// Program the device timeout. Returns the timeout the driver actually
    /// applied, which may differ from the request.
    fn set_timeout(&mut self, secs: u32) -> Result<u32>;

    /// Feed the device once.
    fn keepalive(&mut self) -> Result<()>;

    /// Write the magic-close byte. The driver then treats the next close
    /// as a clean release instead of a reason to reset the machine.
    fn magic_close(&mut self) -> Result<()>;
}

mod ioctl {
    use nix::libc::c_int;

    nix::ioctl_read!(wdioc_keepalive, b'W', 5, c_int);
    nix::ioctl_readwrite!(wdioc_settimeout, b'W', 6, c_int);
}

pub struct HardwareWatchdog {
    file: File,
}

impl HardwareWatchdog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open watchdog device {}", path.display()))?;
        Ok(Self { file })
    }
}

impl WatchdogDevice for HardwareWatchdog {
    fn set_timeout(&mut self, secs: u32) -> Result<u32> {
        let mut val = secs as c_int;
        // SAFETY: fd is an open watchdog device and WDIOC_SETTIMEOUT
        // transfers a single int in both directions.
        unsafe { ioctl::wdioc_settimeout(self.file.as_raw_fd(), &mut val) }
            .context("WDIOC_SETTIMEOUT failed")?;
        Ok(val as u32)
    }

    fn keepalive(&mut self) -> Result<()> {
        let mut dummy: c_int = 0;
        // SAFETY: fd is an open watchdog device; WDIOC_KEEPALIVE only
        // writes its status int.
        unsafe { ioctl::wdioc_keepalive(self.file.as_raw_fd(), &mut dummy) }
            .context("WDIOC_KEEPALIVE failed")?;
        Ok(())
    }

    fn magic_close(&mut self) -> Result<()> {
        self.file
            .write_all(b"V")
            .context("magic-close write failed")
    }
}
