// ABOUTME: Primus init system (PID 1).
// ABOUTME: Hosts the runlevel state machine and feeds it signals and datagrams.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rustix::process::getpid;
use tracing::{debug, error, info, warn};

use primus_initd::config::{self, InitConfig};
use primus_initd::listener::{Datagram, NotifyListener};
use primus_initd::runlevel::{self, Machine, Runlevel, ServiceControl, State, StepOutcome};
use primus_initd::service::ServiceManager;
use primus_initd::sessionlog::SessionLog;
use primus_initd::signals::InitSignals;
use primus_initd::{dependency, logging, mount, shutdown};

const TICK: Duration = Duration::from_millis(100);

fn main() {
    logging::init();

    let pid = getpid();
    info!(pid = pid.as_raw_nonzero().get(), "primus init starting");

    if let Err(e) = run() {
        // PID 1 must never exit; park and keep reaping so the admin can
        // still inspect the console.
        error!(error = format!("{e:#}"), "init failed");
        loop {
            while let Ok(Some(_)) =
                rustix::process::waitpid(None, rustix::process::WaitOptions::NOHANG)
            {}
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

fn run() -> anyhow::Result<()> {
    mount::mount_early_filesystems();

    let init_cfg = config::load_init_config(Path::new(config::INIT_CONFIG_PATH))?;
    let signals = InitSignals::register().context("failed to install signal handlers")?;

    let services = match load_and_validate(&init_cfg) {
        Ok(services) => services,
        Err(e) => {
            // Bad config must not kill PID 1; boot with nothing and let
            // the admin fix it and reload.
            error!(error = format!("{e:#}"), "service configuration rejected");
            Vec::new()
        }
    };

    let listener = match NotifyListener::bind(&init_cfg.notify_socket) {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!(error = format!("{e:#}"), "readiness listener unavailable");
            None
        }
    };

    let mut log = SessionLog::open(&init_cfg.session_log);
    let mut manager = ServiceManager::new(services.clone(), init_cfg.notify_socket.clone());
    let mut machine = Machine::new(services.clone(), init_cfg.default_runlevel);

    // Dispatch the bootstrap runlevel. Boot is complete once every
    // notifying member has reported ready; the rest count as ready at
    // spawn. Without a listener nobody can report, so nobody waits.
    let boot_set = runlevel::members_of(&services, init_cfg.default_runlevel);
    info!(runlevel = %init_cfg.default_runlevel, services = boot_set.len(), "bootstrapping");
    for name in dependency::start_order(&boot_set, &services) {
        manager.start(&name);
    }
    let mut awaiting_ready: BTreeSet<String> = if listener.is_some() {
        services
            .iter()
            .filter(|s| s.notify && boot_set.contains(&s.name))
            .map(|s| s.name.clone())
            .collect()
    } else {
        BTreeSet::new()
    };

    loop {
        if signals.take_child_exited() {
            for name in manager.reap() {
                awaiting_ready.remove(&name);
                machine.post_service_stopped(name);
            }
        }

        if let Some(listener) = &listener {
            for dgram in listener.drain() {
                handle_datagram(&dgram, &mut machine, &manager, &mut awaiting_ready);
            }
        }

        if machine.state() == State::Bootstrap && awaiting_ready.is_empty() {
            machine.post_boot_complete();
        }

        if signals.take_reload_requested() {
            reload(&init_cfg, &mut machine, &mut manager);
        }

        if let Some(kind) = signals.take_shutdown_command() {
            info!(command = %kind, "shutdown requested");
            machine.post_shutdown(kind);
        }

        if let StepOutcome::Shutdown(kind) = machine.step(&mut manager, &mut log) {
            shutdown::perform(kind, &mut manager);
        }

        std::thread::sleep(TICK);
    }
}

fn load_and_validate(init_cfg: &InitConfig) -> anyhow::Result<Vec<config::ServiceConfig>> {
    let services = config::load_services_from_dir(&init_cfg.service_dir)?;
    dependency::validate(&services)?;
    Ok(services)
}

fn handle_datagram(
    dgram: &Datagram,
    machine: &mut Machine,
    manager: &ServiceManager,
    awaiting_ready: &mut BTreeSet<String>,
) {
    for line in dgram.lines() {
        if line == "READY=1" {
            match dgram.pid.and_then(|pid| manager.name_of_pid(pid)) {
                Some(name) => {
                    debug!(service = %name, "service reported ready");
                    awaiting_ready.remove(name);
                }
                None => debug!(pid = ?dgram.pid, "readiness from unknown sender"),
            }
        } else if let Some(raw) = line.strip_prefix("RUNLEVEL=") {
            match raw.parse::<u8>().ok().and_then(|n| Runlevel::new(n).ok()) {
                Some(level) => {
                    info!(runlevel = %level, "runlevel change requested");
                    machine.request_runlevel(level);
                }
                None => warn!(value = raw, "invalid runlevel request discarded"),
            }
        } else if line == "STOPPING=1" {
            debug!(pid = ?dgram.pid, "peer announced stop");
        } else {
            debug!(line, "ignoring unknown notify key");
        }
    }
}

fn reload(init_cfg: &InitConfig, machine: &mut Machine, manager: &mut ServiceManager) {
    match load_and_validate(init_cfg) {
        Ok(services) => {
            info!(services = services.len(), "service definitions reloaded");
            machine.set_services(services.clone());
            manager.set_services(services);
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "reload failed, keeping previous definitions");
        }
    }
}
