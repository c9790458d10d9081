// ABOUTME: The boot/runlevel state machine.
// ABOUTME: Decides which services should run and when init must tear the system down.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::dependency;
use crate::sessionlog::SessionLog;

/// One of the ten runlevels, validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "u8")]
pub struct Runlevel(u8);

#[derive(Debug, thiserror::Error)]
#[error("invalid runlevel {0}, supported levels are 0-9")]
pub struct InvalidRunlevel(pub u8);

impl Runlevel {
    pub const DEFAULT: Runlevel = Runlevel(2);

    pub fn new(level: u8) -> Result<Self, InvalidRunlevel> {
        if level <= 9 {
            Ok(Self(level))
        } else {
            Err(InvalidRunlevel(level))
        }
    }

    pub fn digit(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Runlevel {
    type Error = InvalidRunlevel;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level)
    }
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the machine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Bootstrap,
    Running,
    RunlevelChange,
    RunlevelWaitStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Halt,
    Poweroff,
    Reboot,
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownKind::Halt => "halt",
            ShutdownKind::Poweroff => "poweroff",
            ShutdownKind::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

/// Result of one `step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// The hosting loop must tear the system down and call the kernel.
    Shutdown(ShutdownKind),
}

/// The seam to the process supervisor. The machine only ever names
/// services; it never touches pids or child handles itself.
pub trait ServiceControl {
    fn running(&self) -> BTreeSet<String>;
    fn start(&mut self, name: &str);
    fn stop(&mut self, name: &str);
    fn stop_all(&mut self);
}

enum Event {
    BootComplete,
    ServiceStopped(String),
}

/// Runlevel membership derived from the service configs.
#[derive(Debug, Default, Clone)]
struct RunlevelTable {
    members: BTreeMap<Runlevel, BTreeSet<String>>,
}

impl RunlevelTable {
    fn from_services(services: &[ServiceConfig]) -> Self {
        let mut members: BTreeMap<Runlevel, BTreeSet<String>> = BTreeMap::new();
        for svc in services {
            for level in &svc.runlevels {
                members.entry(*level).or_default().insert(svc.name.clone());
            }
        }
        Self { members }
    }

    fn members(&self, level: Runlevel) -> BTreeSet<String> {
        self.members.get(&level).cloned().unwrap_or_default()
    }
}

/// Services belonging to `level`, by name.
pub fn members_of(services: &[ServiceConfig], level: Runlevel) -> BTreeSet<String> {
    services
        .iter()
        .filter(|s| s.in_runlevel(level))
        .map(|s| s.name.clone())
        .collect()
}

/// Steps between escalation warnings while parked in RunlevelWaitStop.
const STUCK_WARN_TICKS: u32 = 50;

/// The boot/runlevel state machine. One instance exists for the lifetime
/// of the init process.
///
/// Signal handlers never call into this type; the hosting loop translates
/// signals and datagrams into posted events, and `step` alone consumes
/// them. `step` is cooperative and must not be invoked reentrantly.
pub struct Machine {
    state: State,
    current: Runlevel,
    target: Runlevel,
    services: Vec<ServiceConfig>,
    table: RunlevelTable,
    pending_stops: BTreeSet<String>,
    events: VecDeque<Event>,
    shutdown: Option<ShutdownKind>,
    wait_ticks: u32,
}

impl Machine {
    pub fn new(services: Vec<ServiceConfig>, default_level: Runlevel) -> Self {
        let table = RunlevelTable::from_services(&services);
        Self {
            state: State::Bootstrap,
            current: default_level,
            target: default_level,
            services,
            table,
            pending_stops: BTreeSet::new(),
            events: VecDeque::new(),
            shutdown: None,
            wait_ticks: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn current_runlevel(&self) -> Runlevel {
        self.current
    }

    pub fn target_runlevel(&self) -> Runlevel {
        self.target
    }

    /// Swap in a reloaded service table. The current change, if any, keeps
    /// its pending stop-set; membership is re-read on the next transition.
    pub fn set_services(&mut self, services: Vec<ServiceConfig>) {
        self.table = RunlevelTable::from_services(&services);
        self.services = services;
    }

    /// Ask for a runlevel change. While a change is in flight the most
    /// recent request wins; requests are never queued.
    pub fn request_runlevel(&mut self, level: Runlevel) {
        if self.state == State::Running && level == self.current {
            debug!(runlevel = %level, "already at requested runlevel");
            return;
        }
        if self.target != level
            && matches!(self.state, State::RunlevelChange | State::RunlevelWaitStop)
        {
            info!(superseded = %self.target, now = %level, "pending runlevel request overwritten");
        }
        self.target = level;
    }

    pub fn post_boot_complete(&mut self) {
        self.events.push_back(Event::BootComplete);
    }

    pub fn post_service_stopped(&mut self, name: String) {
        self.events.push_back(Event::ServiceStopped(name));
    }

    /// Record a halt/poweroff/reboot command. Consumed by the next `step`;
    /// a later command overwrites an unconsumed earlier one.
    pub fn post_shutdown(&mut self, kind: ShutdownKind) {
        self.shutdown = Some(kind);
    }

    /// Advance the machine. The only function that changes `state`.
    pub fn step(&mut self, ctl: &mut dyn ServiceControl, log: &mut SessionLog) -> StepOutcome {
        if let Some(kind) = self.shutdown.take() {
            info!(command = %kind, "shutdown command, stopping all services");
            ctl.stop_all();
            if let Err(e) = log.record_halt() {
                warn!(error = %e, "session log write failed");
            }
            return StepOutcome::Shutdown(kind);
        }

        let mut boot_complete = false;
        while let Some(event) = self.events.pop_front() {
            match event {
                Event::BootComplete => boot_complete = true,
                Event::ServiceStopped(name) => {
                    self.pending_stops.remove(&name);
                }
            }
        }

        match self.state {
            State::Bootstrap => {
                if boot_complete {
                    info!(runlevel = %self.current, "boot complete");
                    if let Err(e) = log.record_boot() {
                        warn!(error = %e, "session log write failed");
                    }
                    self.state = State::Running;
                }
            }
            State::Running => {
                if self.target != self.current {
                    self.begin_change(ctl);
                }
            }
            State::RunlevelWaitStop => {
                if self.pending_stops.is_empty() {
                    self.state = State::RunlevelChange;
                    self.finish_change(ctl, log);
                } else {
                    self.wait_ticks += 1;
                    if self.wait_ticks % STUCK_WARN_TICKS == 0 {
                        warn!(
                            pending = ?self.pending_stops,
                            target = %self.target,
                            "still waiting for services to stop"
                        );
                    }
                }
            }
            State::RunlevelChange => {
                self.finish_change(ctl, log);
            }
        }

        StepOutcome::Continue
    }

    /// Dispatch the stop-set for the requested change and start waiting.
    fn begin_change(&mut self, ctl: &mut dyn ServiceControl) {
        let stop_set = self.stop_set(ctl);
        info!(
            from = %self.current,
            to = %self.target,
            stopping = stop_set.len(),
            "runlevel change requested"
        );
        for name in dependency::stop_order(&stop_set, &self.services) {
            ctl.stop(&name);
        }
        self.pending_stops = stop_set;
        self.wait_ticks = 0;
        self.state = State::RunlevelWaitStop;
    }

    /// All stops confirmed. The target may have moved meanwhile, so the
    /// stop-set is re-checked before starts go out.
    fn finish_change(&mut self, ctl: &mut dyn ServiceControl, log: &mut SessionLog) {
        let more_stops = self.stop_set(ctl);
        if !more_stops.is_empty() {
            info!(to = %self.target, stopping = more_stops.len(), "change retargeted, more stops needed");
            for name in dependency::stop_order(&more_stops, &self.services) {
                ctl.stop(&name);
            }
            self.pending_stops = more_stops;
            self.wait_ticks = 0;
            self.state = State::RunlevelWaitStop;
            return;
        }

        let running = ctl.running();
        let start_set: BTreeSet<String> = self
            .table
            .members(self.target)
            .into_iter()
            .filter(|name| !running.contains(name))
            .collect();
        for name in dependency::start_order(&start_set, &self.services) {
            ctl.start(&name);
        }

        let previous = self.current;
        self.current = self.target;
        info!(
            from = %previous,
            to = %self.current,
            started = start_set.len(),
            "runlevel change complete"
        );
        if previous != self.current {
            if let Err(e) = log.record_runlevel(previous, self.current) {
                warn!(error = %e, "session log write failed");
            }
        }
        self.state = State::Running;
    }

    /// Services that belong to the current level, are absent from the
    /// target level, and are actually running.
    fn stop_set(&self, ctl: &dyn ServiceControl) -> BTreeSet<String> {
        let running = ctl.running();
        let keep = self.table.members(self.target);
        self.table
            .members(self.current)
            .into_iter()
            .filter(|name| !keep.contains(name) && running.contains(name))
            .collect()
    }
}
