// ABOUTME: Signal handling for the watchdog guard.
// ABOUTME: SIGTERM requests handover, SIGPWR announces system shutdown.

use signal_hook::consts::SIGTERM;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flags set by the signal handlers. Handlers do nothing but store; every
/// consequence happens in the guard's own loop.
pub struct GuardSignals {
    pub handover: Arc<AtomicBool>,
    pub shutdown: Arc<AtomicBool>,
}

impl GuardSignals {
    pub fn register() -> std::io::Result<Self> {
        let handover = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        signal_hook::flag::register(SIGTERM, Arc::clone(&handover))?;
        signal_hook::flag::register(libc::SIGPWR, Arc::clone(&shutdown))?;

        Ok(Self { handover, shutdown })
    }

    /// Flags without installed handlers, for driving the guard in tests.
    #[cfg(test)]
    pub fn unregistered() -> Self {
        Self {
            handover: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A successor watchdog wants the device. Level-triggered; never cleared.
    pub fn handover(&self) -> bool {
        self.handover.load(Ordering::Relaxed)
    }

    /// A shutdown notice is pending but has not been consumed yet.
    pub fn shutdown_pending(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Consume one shutdown notice. The signal can arrive repeatedly; each
    /// take observes at least one delivery since the previous take.
    pub fn take_shutdown(&self) -> bool {
        self.shutdown.swap(false, Ordering::Relaxed)
    }

    pub fn stop_requested(&self) -> bool {
        self.handover() || self.shutdown_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_clear() {
        let signals = GuardSignals::unregistered();
        assert!(!signals.handover());
        assert!(!signals.shutdown_pending());
        assert!(!signals.stop_requested());
    }

    #[test]
    fn take_shutdown_resets_flag() {
        let signals = GuardSignals::unregistered();
        signals.shutdown.store(true, Ordering::Relaxed);
        assert!(signals.take_shutdown());
        assert!(!signals.take_shutdown());
    }

    #[test]
    fn handover_is_never_cleared() {
        let signals = GuardSignals::unregistered();
        signals.handover.store(true, Ordering::Relaxed);
        assert!(signals.handover());
        assert!(signals.handover());
        assert!(signals.stop_requested());
    }

    #[test]
    fn registering_real_handlers_succeeds() {
        let signals = GuardSignals::register().unwrap();
        assert!(!signals.stop_requested());
    }
}
