//! Energy source contracts.
//!
//! Hardware specifics (RAPL MSR access, Redfish, HMC) stay outside the
//! core; the collector consumes cumulative energy counters through these
//! traits. All values are milli-joules; rollover of the cumulative readings
//! is handled in the stats store via `set_aggregate`, not here.
//!
//! Two concrete sysfs-backed sources ship with the agent:
//! [`powercap::PowercapSource`] for per-socket component energy and
//! [`hwmon::HwmonPlatformSource`] for whole-node sensors. Redfish/HMC
//! endpoints are recognized in configuration but have no backend in this
//! build; the power model estimates instead.

pub mod hwmon;
pub mod powercap;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::SourceError;

/// Cumulative milli-joule counters for one CPU socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentEnergy {
    pub pkg: u64,
    pub core: u64,
    pub uncore: u64,
    pub dram: u64,
}

/// Per-socket component energy, keyed by socket id ("0", "1", ...).
pub type ComponentReading = BTreeMap<String, ComponentEnergy>;

/// Whole-node sensor energy in milli-joules, keyed by sensor id.
pub type PlatformReading = BTreeMap<String, u64>;

/// Source of per-socket {pkg, core, uncore, dram} energy counters.
pub trait ComponentEnergySource: Send {
    /// Short identifier used in logs and the failure budget.
    fn name(&self) -> &'static str;

    fn energy_from_components(&mut self) -> Result<ComponentReading, SourceError>;
}

/// Source of node-level platform sensor counters.
pub trait PlatformEnergySource: Send {
    fn name(&self) -> &'static str;

    fn energy_from_platform(&mut self) -> Result<PlatformReading, SourceError>;
}

/// Replays canned component readings; test double and offline replay aid.
#[derive(Debug, Default)]
pub struct ReplayComponentSource {
    readings: Mutex<VecDeque<ComponentReading>>,
}

impl ReplayComponentSource {
    pub fn new(readings: Vec<ComponentReading>) -> Self {
        Self {
            readings: Mutex::new(readings.into()),
        }
    }

    pub fn push(&self, reading: ComponentReading) {
        self.readings
            .lock()
            .expect("replay queue poisoned")
            .push_back(reading);
    }
}

impl ComponentEnergySource for ReplayComponentSource {
    fn name(&self) -> &'static str {
        "replay-components"
    }

    fn energy_from_components(&mut self) -> Result<ComponentReading, SourceError> {
        let mut queue = self.readings.lock().expect("replay queue poisoned");
        Ok(queue.pop_front().unwrap_or_default())
    }
}

/// Replays canned platform readings.
#[derive(Debug, Default)]
pub struct ReplayPlatformSource {
    readings: Mutex<VecDeque<PlatformReading>>,
}

impl ReplayPlatformSource {
    pub fn new(readings: Vec<PlatformReading>) -> Self {
        Self {
            readings: Mutex::new(readings.into()),
        }
    }

    pub fn push(&self, reading: PlatformReading) {
        self.readings
            .lock()
            .expect("replay queue poisoned")
            .push_back(reading);
    }
}

impl PlatformEnergySource for ReplayPlatformSource {
    fn name(&self) -> &'static str {
        "replay-platform"
    }

    fn energy_from_platform(&mut self) -> Result<PlatformReading, SourceError> {
        let mut queue = self.readings.lock().expect("replay queue poisoned");
        Ok(queue.pop_front().unwrap_or_default())
    }
}
