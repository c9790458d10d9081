// ABOUTME: Thin process supervisor for runlevel members.
// ABOUTME: Spawns, signals, and reaps services; stop completion flows back as events.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::runlevel::ServiceControl;

/// How long stop_all waits for SIGTERM to work before escalating.
const STOP_ALL_GRACE: Duration = Duration::from_secs(2);

/// Supervises the processes the state machine names. Deliberately thin:
/// no restart policies and no backoff; a service that exits stays down
/// until a runlevel transition starts it again.
pub struct ServiceManager {
    configs: BTreeMap<String, ServiceConfig>,
    running: BTreeMap<String, Child>,
    notify_socket: PathBuf,
}

impl ServiceManager {
    pub fn new(services: Vec<ServiceConfig>, notify_socket: PathBuf) -> Self {
        Self {
            configs: services
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            running: BTreeMap::new(),
            notify_socket,
        }
    }

    /// Swap in reloaded definitions. Running children are untouched; the
    /// new configs apply from the next start.
    pub fn set_services(&mut self, services: Vec<ServiceConfig>) {
        self.configs = services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// The service a readiness datagram came from, keyed by sender pid.
    pub fn name_of_pid(&self, pid: i32) -> Option<&str> {
        self.running
            .iter()
            .find(|(_, child)| child.id() as i32 == pid)
            .map(|(name, _)| name.as_str())
    }

    /// Collect every child that has exited since the last check. Returns
    /// their names; the caller turns them into stop events.
    pub fn reap(&mut self) -> Vec<String> {
        let mut exited = Vec::new();

        for (name, child) in &mut self.running {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        info!(service = %name, "service exited");
                    } else {
                        warn!(service = %name, status = ?status, "service exited with error");
                    }
                    exited.push(name.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    error!(service = %name, error = %e, "failed to check service status");
                }
            }
        }

        for name in &exited {
            self.running.remove(name);
        }

        exited
    }
}

impl ServiceControl for ServiceManager {
    fn running(&self) -> BTreeSet<String> {
        self.running.keys().cloned().collect()
    }

    /// Fire-and-forget: a spawn failure is logged, never propagated. The
    /// state machine does not track start completion.
    fn start(&mut self, name: &str) {
        if self.running.contains_key(name) {
            debug!(service = %name, "already running");
            return;
        }
        let Some(config) = self.configs.get(name) else {
            error!(service = %name, "no definition for requested service");
            return;
        };

        let mut cmd = Command::new(&config.exec);
        cmd.args(&config.args);
        for (key, val) in &config.environment {
            cmd.env(key, val);
        }
        if config.notify {
            cmd.env(primus_notify::NOTIFY_SOCKET_ENV, &self.notify_socket);
        }

        match cmd.spawn() {
            Ok(child) => {
                info!(service = %name, pid = child.id(), "service started");
                self.running.insert(name.to_string(), child);
            }
            Err(e) => {
                error!(service = %name, exec = %config.exec, error = %e, "failed to start service");
            }
        }
    }

    /// Ask the child to stop. Completion is observed later through reap;
    /// the child stays in the running table until then.
    fn stop(&mut self, name: &str) {
        let Some(child) = self.running.get(name) else {
            debug!(service = %name, "stop requested for service that is not running");
            return;
        };
        let pid = Pid::from_raw(child.id() as i32);
        info!(service = %name, pid = pid.as_raw(), "stopping service");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!(service = %name, error = %e, "failed to signal service");
        }
    }

    /// Synchronous teardown for the shutdown path: SIGTERM everything,
    /// give the grace period, then SIGKILL whatever is left.
    fn stop_all(&mut self) {
        for (name, child) in &self.running {
            let pid = Pid::from_raw(child.id() as i32);
            info!(service = %name, pid = pid.as_raw(), "stopping service");
            let _ = kill(pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + STOP_ALL_GRACE;
        while !self.running.is_empty() && Instant::now() < deadline {
            self.reap();
            std::thread::sleep(Duration::from_millis(50));
        }

        for (name, child) in &mut self.running {
            warn!(service = %name, "service ignored SIGTERM, killing");
            let _ = child.kill();
            let _ = child.wait();
        }
        self.running.clear();
    }
}
