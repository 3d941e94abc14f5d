//! Power attribution.
//!
//! Splits the node's measured dynamic energy per component across entities
//! using a ratio over a chosen resource signal, or a pre-fitted linear
//! regressor when coefficients exist for the host's microarchitecture.
//! Runs as phase F of the tick, after resource rollup, under the tick
//! lock.

pub mod cpuid;
mod idle;
mod regressor;

pub use idle::{IdleDecomposer, DEFAULT_WARMUP_TICKS};
pub use regressor::{LinearModel, Regressor, UarchCoefficients};

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::metrics::{Component, Mode, ResourceMetric, RATIO_FALLBACK_CHAIN};
use crate::resolver::ContainerInfo;
use crate::store::{Container, Owner, StoreData};

pub struct PowerModel {
    ratio_metrics: BTreeMap<Component, ResourceMetric>,
    idle: IdleDecomposer,
    regressor: Regressor,
    idle_attribution: bool,
}

impl PowerModel {
    pub fn new(
        ratio_overrides: BTreeMap<Component, ResourceMetric>,
        idle_warmup_ticks: u32,
        regressor: Regressor,
        idle_attribution: bool,
    ) -> Self {
        Self {
            ratio_metrics: ratio_overrides,
            idle: IdleDecomposer::new(idle_warmup_ticks),
            regressor,
            idle_attribution,
        }
    }

    fn ratio_metric(&self, component: Component) -> ResourceMetric {
        self.ratio_metrics
            .get(&component)
            .copied()
            .unwrap_or_else(|| component.default_ratio_metric())
    }

    /// Phase F: decompose this tick's absolute node energy into idle and
    /// dynamic, then attribute the dynamic share to processes and roll it
    /// up into containers, pods, VMs and the node.
    pub fn attribute(&mut self, data: &mut StoreData) {
        for component in Component::ALL {
            let members: Vec<(String, u64)> = match data.node.absolute.get(&component) {
                Some(collection) => collection
                    .iter()
                    .map(|(name, counter)| (name.to_string(), counter.delta()))
                    .collect(),
                None => continue,
            };
            if members.is_empty() {
                continue;
            }

            let mut node_abs = 0u64;
            let mut node_idle = 0u64;
            for (source, abs_delta) in &members {
                let idle = self.idle.observe(component, source, *abs_delta);
                node_abs = node_abs.saturating_add(*abs_delta);
                node_idle = node_idle.saturating_add(idle);
            }
            let node_dyn = node_abs.saturating_sub(node_idle);

            record(&mut data.node.energy, component, Mode::Dynamic, node_dyn);
            record(&mut data.node.energy, component, Mode::Idle, node_idle);

            if node_dyn > 0 {
                self.split_dynamic(data, component, node_dyn);
            }
            if self.idle_attribution && node_idle > 0 {
                distribute_idle(data, component, node_idle);
            }
        }
    }

    fn split_dynamic(&self, data: &mut StoreData, component: Component, node_dyn: u64) {
        if let Some(model) = self.regressor.model_for(component) {
            let estimates: Vec<(u32, f64)> = data
                .processes
                .iter()
                .map(|(&pid, p)| (pid, model.predict(&p.resources)))
                .collect();
            let sum: f64 = estimates.iter().map(|&(_, e)| e).sum();
            if sum > 0.0 {
                // Renormalize so the entity sum equals the measured node
                // dynamic energy; floor keeps the conservation invariant.
                let shares: Vec<(u32, u64)> = estimates
                    .into_iter()
                    .map(|(pid, e)| (pid, (node_dyn as f64 * e / sum).floor() as u64))
                    .collect();
                assign_and_roll_up(data, component, &shares);
                return;
            }
            // Regressor produced nothing usable; fall through to the ratio
            // estimator.
        }

        let mut metric = self.ratio_metric(component);
        let mut node_usage = data.node.resources.delta(metric);
        if node_usage == 0 {
            for fallback in RATIO_FALLBACK_CHAIN {
                let usage = data.node.resources.delta(fallback);
                if usage > 0 {
                    metric = fallback;
                    node_usage = usage;
                    break;
                }
            }
        }

        if node_usage == 0 {
            // No usable signal at all: credit the residual to the system
            // sentinel rather than dropping measured energy.
            let system = data.ensure_container(&ContainerInfo::system());
            record(&mut system.energy, component, Mode::Dynamic, node_dyn);
            tracing::debug!(
                component = %component,
                millijoules = node_dyn,
                "no ratio signal, dynamic energy credited to system"
            );
            return;
        }

        let shares: Vec<(u32, u64)> = data
            .processes
            .iter()
            .map(|(&pid, p)| {
                let usage = p.resources.delta(metric);
                let share =
                    (node_dyn as u128 * usage as u128 / node_usage as u128) as u64;
                (pid, share)
            })
            .collect();
        assign_and_roll_up(data, component, &shares);
    }
}

fn record(energy: &mut crate::store::EnergyUsage, component: Component, mode: Mode, mj: u64) {
    if let Err(e) = energy.add_delta(component, mode, mj) {
        tracing::debug!(component = %component, mode = %mode, error = %e, "energy counter signal");
    }
}

/// Write per-process dynamic shares and roll them up into owners.
fn assign_and_roll_up(data: &mut StoreData, component: Component, shares: &[(u32, u64)]) {
    let mut per_container: FxHashMap<String, u64> = FxHashMap::default();
    let mut per_vm: FxHashMap<String, u64> = FxHashMap::default();

    for &(pid, share) in shares {
        if share == 0 {
            continue;
        }
        let Some(process) = data.processes.get_mut(&pid) else {
            continue;
        };
        record(&mut process.energy, component, Mode::Dynamic, share);
        match &process.owner {
            Owner::Container(id) => *per_container.entry(id.clone()).or_default() += share,
            Owner::Vm(id) => *per_vm.entry(id.clone()).or_default() += share,
        }
    }

    for (id, share) in per_container {
        let pod_key = data.containers.get(&id).map(Container::pod_key);
        if let Some(container) = data.containers.get_mut(&id) {
            record(&mut container.energy, component, Mode::Dynamic, share);
        }
        if let Some(pod) = pod_key.and_then(|k| data.pods.get_mut(&k)) {
            record(&mut pod.energy, component, Mode::Dynamic, share);
        }
    }
    for (id, share) in per_vm {
        if let Some(vm) = data.vms.get_mut(&id) {
            record(&mut vm.energy, component, Mode::Dynamic, share);
        }
    }
}

/// Optional idle attribution: spread the node's idle share evenly across
/// currently-known containers.
fn distribute_idle(data: &mut StoreData, component: Component, node_idle: u64) {
    let count = data.containers.len() as u64;
    if count == 0 {
        return;
    }
    let share = node_idle / count;
    if share == 0 {
        return;
    }
    let ids: Vec<String> = data.containers.keys().cloned().collect();
    for id in ids {
        let pod_key = data.containers.get(&id).map(Container::pod_key);
        if let Some(container) = data.containers.get_mut(&id) {
            record(&mut container.energy, component, Mode::Idle, share);
        }
        if let Some(pod) = pod_key.and_then(|k| data.pods.get_mut(&k)) {
            record(&mut pod.energy, component, Mode::Idle, share);
        }
    }
}
