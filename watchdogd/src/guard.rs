// ABOUTME: The watchdog refresh loop and its exit policies.
// ABOUTME: Feeds the device until handover or shutdown, then releases or degrades.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::device::WatchdogDevice;
use crate::signals::GuardSignals;

/// How often a sleeping loop re-checks the signal flags.
const FLAG_POLL: Duration = Duration::from_millis(250);

pub struct Guard<D> {
    device: D,
    timeout: u32,
    period: Duration,
}

impl<D: WatchdogDevice> Guard<D> {
    /// Arm the device with `timeout` seconds and derive the refresh period.
    ///
    /// The period is timeout/2, so at least one refresh lands inside any
    /// device-enforced window even when a single tick is delayed.
    pub fn new(mut device: D, timeout: u32) -> anyhow::Result<Self> {
        let effective = device.set_timeout(timeout)?;
        if effective != timeout {
            info!(requested = timeout, effective, "driver adjusted watchdog timeout");
        }
        Ok(Self {
            device,
            timeout: effective,
            period: Duration::from_secs(u64::from((effective / 2).max(1))),
        })
    }

    /// Run until a signal ends the session, perform the exit action once,
    /// then hold the device handle until a successor takes over.
    pub fn run(&mut self, signals: &GuardSignals) {
        info!(
            timeout = self.timeout,
            period_secs = self.period.as_secs(),
            "watchdog refresh loop running"
        );

        let mut shutdown_seen = false;
        loop {
            if signals.handover() {
                break;
            }
            if signals.take_shutdown() {
                shutdown_seen = true;
                break;
            }
            sleep_watching_flags(self.period, signals);
            if signals.stop_requested() {
                continue;
            }
            if let Err(e) = self.device.keepalive() {
                error!(error = %e, "watchdog keepalive failed");
            }
        }

        self.exit_action(signals.handover(), shutdown_seen);
        self.await_handover(signals);
    }

    /// Runs exactly once after the refresh loop stops.
    fn exit_action(&mut self, handover: bool, shutdown: bool) {
        if handover {
            info!("handover requested, releasing watchdog cleanly");
            if let Err(e) = self.device.keepalive() {
                warn!(error = %e, "final keepalive failed");
            }
            if let Err(e) = self.device.magic_close() {
                error!(error = %e, "magic close failed, device stays armed");
            }
        } else if shutdown {
            let short = (self.timeout / 3).max(1);
            info!(timeout = short, "shutdown notice, shrinking watchdog window");
            if let Err(e) = self.device.set_timeout(short) {
                error!(error = %e, "failed to shrink watchdog timeout");
            }
        } else {
            // Unexpected exit: keep the device armed so the hardware still
            // resets a wedged system.
            error!("refresh loop ended without handover or shutdown notice");
        }
    }

    /// Keep the handle open until the handover flag shows. Every further
    /// shutdown notice re-arms the short window; the notice is idempotent.
    fn await_handover(&mut self, signals: &GuardSignals) {
        while !signals.handover() {
            if signals.take_shutdown() {
                let short = (self.timeout / 3).max(1);
                warn!(timeout = short, "shutdown notice repeated, re-arming short window");
                if let Err(e) = self.device.set_timeout(short) {
                    error!(error = %e, "failed to re-arm short watchdog timeout");
                }
            }
            thread::sleep(FLAG_POLL);
        }
    }
}

/// Sleep for `total`, waking early as soon as a stop flag shows.
fn sleep_watching_flags(total: Duration, signals: &GuardSignals) {
    let deadline = Instant::now() + total;
    loop {
        if signals.stop_requested() {
            return;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        thread::sleep(left.min(FLAG_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        SetTimeout(u32),
        Keepalive,
        MagicClose,
    }

    #[derive(Clone, Default)]
    struct MockDevice {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl MockDevice {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl WatchdogDevice for MockDevice {
        fn set_timeout(&mut self, secs: u32) -> anyhow::Result<u32> {
            self.calls.lock().unwrap().push(Call::SetTimeout(secs));
            Ok(secs)
        }

        fn keepalive(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Keepalive);
            Ok(())
        }

        fn magic_close(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::MagicClose);
            Ok(())
        }
    }

    #[test]
    fn new_arms_device_and_halves_period() {
        let device = MockDevice::default();
        let guard = Guard::new(device.clone(), 20).unwrap();
        assert_eq!(device.calls(), vec![Call::SetTimeout(20)]);
        assert_eq!(guard.period, Duration::from_secs(10));
    }

    #[test]
    fn handover_releases_cleanly() {
        let device = MockDevice::default();
        let mut guard = Guard::new(device.clone(), 6).unwrap();
        let signals = GuardSignals::unregistered();
        signals.handover.store(true, Ordering::Relaxed);

        guard.run(&signals);

        // One arming call, then exactly one final keepalive and one
        // magic-close write.
        assert_eq!(
            device.calls(),
            vec![Call::SetTimeout(6), Call::Keepalive, Call::MagicClose]
        );
    }

    #[test]
    fn handover_wins_over_shutdown() {
        let device = MockDevice::default();
        let mut guard = Guard::new(device.clone(), 9).unwrap();
        let signals = GuardSignals::unregistered();
        signals.handover.store(true, Ordering::Relaxed);
        signals.shutdown.store(true, Ordering::Relaxed);

        guard.run(&signals);

        let calls = device.calls();
        assert!(calls.contains(&Call::MagicClose));
        // The shutdown degradation never runs once handover is in play.
        assert!(!calls.contains(&Call::SetTimeout(3)));
    }

    #[test]
    fn shutdown_shrinks_timeout_to_a_third() {
        let device = MockDevice::default();
        let mut guard = Guard::new(device.clone(), 9).unwrap();

        guard.exit_action(false, true);

        assert_eq!(
            device.calls(),
            vec![Call::SetTimeout(9), Call::SetTimeout(3)]
        );
    }

    #[test]
    fn unexpected_exit_leaves_device_armed() {
        let device = MockDevice::default();
        let mut guard = Guard::new(device.clone(), 9).unwrap();

        guard.exit_action(false, false);

        assert_eq!(device.calls(), vec![Call::SetTimeout(9)]);
    }

    #[test]
    fn repeated_shutdown_rearms_short_window_until_handover() {
        let device = MockDevice::default();
        let mut guard = Guard::new(device.clone(), 9).unwrap();
        let signals = GuardSignals::unregistered();

        let shutdown = Arc::clone(&signals.shutdown);
        let handover = Arc::clone(&signals.handover);
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            shutdown.store(true, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(400));
            handover.store(true, Ordering::Relaxed);
        });

        guard.await_handover(&signals);
        waker.join().unwrap();

        assert_eq!(
            device.calls(),
            vec![Call::SetTimeout(9), Call::SetTimeout(3)]
        );
    }

    #[test]
    fn keepalive_fires_each_period_while_running() {
        let device = MockDevice::default();
        let mut guard = Guard::new(device.clone(), 2).unwrap();
        let signals = GuardSignals::unregistered();

        let handover = Arc::clone(&signals.handover);
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2300));
            handover.store(true, Ordering::Relaxed);
        });

        guard.run(&signals);
        waker.join().unwrap();

        // Two full one-second periods elapse before handover, so at least
        // two refresh keepalives land plus the final handover one.
        let feeds = device
            .calls()
            .iter()
            .filter(|c| **c == Call::Keepalive)
            .count();
        assert!(feeds >= 3, "expected >= 3 keepalives, saw {feeds}");
    }

    #[test]
    fn sleep_returns_early_when_flag_shows() {
        let signals = GuardSignals::unregistered();
        signals.handover.store(true, Ordering::Relaxed);

        let started = Instant::now();
        sleep_watching_flags(Duration::from_secs(30), &signals);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
