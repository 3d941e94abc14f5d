//! Entity state held by the stats store.
//!
//! Five entity kinds: process, container, pod, virtual machine and the node
//! singleton. Each owns one counter per registry metric plus attributed
//! energy per (component, mode). The node additionally keeps the raw
//! cumulative energy collections (per socket, sensor or device) that
//! attribution splits from.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::metrics::{
    Component, Counter, CounterCollection, CounterError, Mode, ResourceMetric,
};

/// Resource-usage counters for one entity.
#[derive(Debug, Default, Clone)]
pub struct ResourceCounters {
    counters: FxHashMap<ResourceMetric, Counter>,
    /// Per-vector soft IRQ counts; summed view behaves as one metric.
    soft_irq: CounterCollection,
}

impl ResourceCounters {
    pub fn add_delta(&mut self, metric: ResourceMetric, v: u64) -> Result<(), CounterError> {
        debug_assert!(metric != ResourceMetric::SoftIrq, "use add_soft_irq");
        self.counters.entry(metric).or_default().add_delta(v)
    }

    pub fn add_soft_irq(&mut self, vector: &str, v: u64) -> Result<(), CounterError> {
        self.soft_irq.add_delta(vector, v)
    }

    pub fn delta(&self, metric: ResourceMetric) -> u64 {
        match metric {
            ResourceMetric::SoftIrq => self.soft_irq.delta(),
            _ => self.counters.get(&metric).map_or(0, Counter::delta),
        }
    }

    pub fn total(&self, metric: ResourceMetric) -> u64 {
        match metric {
            ResourceMetric::SoftIrq => self.soft_irq.total(),
            _ => self.counters.get(&metric).map_or(0, Counter::total),
        }
    }

    pub fn soft_irq(&self) -> &CounterCollection {
        &self.soft_irq
    }

    pub fn reset_delta(&mut self) {
        for counter in self.counters.values_mut() {
            counter.reset_delta();
        }
        self.soft_irq.reset_delta();
    }
}

/// Attributed energy per (component, mode), in milli-joules.
#[derive(Debug, Default, Clone)]
pub struct EnergyUsage {
    by: BTreeMap<(Component, Mode), Counter>,
}

impl EnergyUsage {
    pub fn add_delta(
        &mut self,
        component: Component,
        mode: Mode,
        millijoules: u64,
    ) -> Result<(), CounterError> {
        self.by
            .entry((component, mode))
            .or_default()
            .add_delta(millijoules)
    }

    pub fn delta(&self, component: Component, mode: Mode) -> u64 {
        self.by
            .get(&(component, mode))
            .map_or(0, Counter::delta)
    }

    pub fn total(&self, component: Component, mode: Mode) -> u64 {
        self.by
            .get(&(component, mode))
            .map_or(0, Counter::total)
    }

    pub fn reset_delta(&mut self) {
        for counter in self.by.values_mut() {
            counter.reset_delta();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Component, Mode, &Counter)> {
        self.by.iter().map(|(&(c, m), counter)| (c, m, counter))
    }
}

/// Who a process belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Container(String),
    Vm(String),
}

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: u32,
    pub command: String,
    pub owner: Owner,
    pub resources: ResourceCounters,
    pub energy: EnergyUsage,
    /// Ticks since this pid last appeared in a probe batch.
    pub idle_ticks: u32,
    /// Set when the probe reported the pid as freed by the kernel.
    pub freed: bool,
}

impl Process {
    pub fn new(pid: u32, owner: Owner) -> Self {
        Self {
            pid,
            command: String::new(),
            owner,
            resources: ResourceCounters::default(),
            energy: EnergyUsage::default(),
            idle_ticks: 0,
            freed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub pod_name: String,
    pub resources: ResourceCounters,
    pub energy: EnergyUsage,
    /// Consecutive ticks with no live child process.
    pub ticks_without_processes: u32,
}

impl Container {
    pub fn new(id: String, name: String, namespace: String, pod_name: String) -> Self {
        Self {
            id,
            name,
            namespace,
            pod_name,
            resources: ResourceCounters::default(),
            energy: EnergyUsage::default(),
            ticks_without_processes: 0,
        }
    }

    /// Pod table key for this container's pod.
    pub fn pod_key(&self) -> String {
        format!("{}/{}", self.namespace, self.pod_name)
    }
}

#[derive(Debug, Clone)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub resources: ResourceCounters,
    pub energy: EnergyUsage,
}

#[derive(Debug, Clone)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    /// Pid of the hypervisor process, zero until one is observed.
    pub pid: u32,
    pub resources: ResourceCounters,
    pub energy: EnergyUsage,
    pub ticks_without_processes: u32,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub cpu_architecture: String,
    pub resources: ResourceCounters,
    /// Attributed energy (the dynamic/idle split written by the model).
    pub energy: EnergyUsage,
    /// Raw cumulative readings per component, one collection member per
    /// socket, sensor or device. Rollover is absorbed here.
    pub absolute: BTreeMap<Component, CounterCollection>,
}

impl Node {
    pub fn new(name: String, cpu_architecture: String) -> Self {
        Self {
            name,
            cpu_architecture,
            resources: ResourceCounters::default(),
            energy: EnergyUsage::default(),
            absolute: BTreeMap::new(),
        }
    }

    pub fn absolute_mut(&mut self, component: Component) -> &mut CounterCollection {
        self.absolute.entry(component).or_default()
    }

    /// Raw delta for a component this tick, summed over its members.
    pub fn absolute_delta(&self, component: Component) -> u64 {
        self.absolute
            .get(&component)
            .map_or(0, CounterCollection::delta)
    }

    pub fn absolute_total(&self, component: Component) -> u64 {
        self.absolute
            .get(&component)
            .map_or(0, CounterCollection::total)
    }
}
