//! Accelerator source contract.
//!
//! Vendor APIs (NVML, DCGM, QAT telemetry) live behind this trait; the
//! collector only needs per-PID utilization samples and cumulative
//! per-device energy. Missing values mean zero, not error.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::error::SourceError;

/// One process's share of a device over the sampling window, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessUtilization {
    pub sm_util: u64,
    pub mem_util: u64,
}

/// Cumulative device energy in milli-joules, keyed by device id.
pub type DeviceEnergyReading = BTreeMap<String, u64>;

/// Per-PID utilization for one device.
pub type UtilizationReading = FxHashMap<u32, ProcessUtilization>;

pub trait AcceleratorSource: Send {
    fn name(&self) -> &'static str;

    /// Device ids present on the host, stable across ticks.
    fn devices(&self) -> Vec<String>;

    /// Utilization per PID on `device` over the last `elapsed` window.
    fn process_utilization(
        &mut self,
        device: &str,
        elapsed: Duration,
    ) -> Result<UtilizationReading, SourceError>;

    fn device_energy(&mut self) -> Result<DeviceEnergyReading, SourceError>;
}

/// Replays canned utilization/energy samples; test double.
#[derive(Debug, Default)]
pub struct ReplayAccelerator {
    device_ids: Vec<String>,
    utilization: Mutex<Vec<FxHashMap<String, UtilizationReading>>>,
    energy: Mutex<Vec<DeviceEnergyReading>>,
}

impl ReplayAccelerator {
    pub fn new(device_ids: Vec<String>) -> Self {
        Self {
            device_ids,
            ..Default::default()
        }
    }

    /// Queue one tick's per-device utilization map.
    pub fn push_utilization(&self, sample: FxHashMap<String, UtilizationReading>) {
        self.utilization
            .lock()
            .expect("replay queue poisoned")
            .push(sample);
    }

    pub fn push_energy(&self, reading: DeviceEnergyReading) {
        self.energy
            .lock()
            .expect("replay queue poisoned")
            .push(reading);
    }
}

impl AcceleratorSource for ReplayAccelerator {
    fn name(&self) -> &'static str {
        "replay-accelerator"
    }

    fn devices(&self) -> Vec<String> {
        self.device_ids.clone()
    }

    fn process_utilization(
        &mut self,
        device: &str,
        _elapsed: Duration,
    ) -> Result<UtilizationReading, SourceError> {
        let queue = self.utilization.lock().expect("replay queue poisoned");
        Ok(queue
            .first()
            .and_then(|sample| sample.get(device))
            .cloned()
            .unwrap_or_default())
    }

    /// Called once per tick, after the per-device utilization reads; pops
    /// both replay queues so the next tick sees the next sample.
    fn device_energy(&mut self) -> Result<DeviceEnergyReading, SourceError> {
        let mut utilization = self.utilization.lock().expect("replay queue poisoned");
        if !utilization.is_empty() {
            utilization.remove(0);
        }
        let mut queue = self.energy.lock().expect("replay queue poisoned");
        if queue.is_empty() {
            Ok(DeviceEnergyReading::default())
        } else {
            Ok(queue.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_returns_queued_samples_per_device() {
        let mut accel = ReplayAccelerator::new(vec!["gpu0".into()]);
        let mut sample = FxHashMap::default();
        let mut util = UtilizationReading::default();
        util.insert(
            100,
            ProcessUtilization {
                sm_util: 40,
                mem_util: 10,
            },
        );
        sample.insert("gpu0".to_string(), util);
        accel.push_utilization(sample);

        let reading = accel
            .process_utilization("gpu0", Duration::from_secs(3))
            .unwrap();
        assert_eq!(reading[&100].sm_util, 40);

        let empty = accel
            .process_utilization("gpu1", Duration::from_secs(3))
            .unwrap();
        assert!(empty.is_empty());
    }
}
