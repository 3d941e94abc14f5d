//! In-memory stats store.
//!
//! The only shared mutable state in the agent. The collector mutates it
//! under the write half of the tick lock; the exporter snapshots under the
//! read half, so a scrape observes either the previous tick or the complete
//! current one, never a half-applied tick.

mod entity;

pub use entity::{
    Container, EnergyUsage, Node, Owner, Pod, Process, ResourceCounters, VirtualMachine,
};

use std::collections::HashSet;

use rustc_hash::FxHashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::accel::ProcessUtilization;
use crate::energy::{ComponentReading, PlatformReading};
use crate::metrics::{Component, MetricRegistry, ResourceMetric, SOFT_IRQ_NAMES};
use crate::probe::ProcessRecord;
use crate::resolver::{ContainerInfo, Resolution, VmInfo, KERNEL_ID, KERNEL_PID, SYSTEM_ID};

/// Synthetic pid the system sentinel's merged processes are stored under.
pub const SYSTEM_PID: u32 = 0;

/// Entity tables for one node.
pub struct StoreData {
    pub node: Node,
    pub processes: FxHashMap<u32, Process>,
    pub containers: FxHashMap<String, Container>,
    pub pods: FxHashMap<String, Pod>,
    pub vms: FxHashMap<String, VirtualMachine>,
}

impl StoreData {
    pub fn new(node_name: String, cpu_architecture: String) -> Self {
        Self {
            node: Node::new(node_name, cpu_architecture),
            processes: FxHashMap::default(),
            containers: FxHashMap::default(),
            pods: FxHashMap::default(),
            vms: FxHashMap::default(),
        }
    }

    /// Phase 0: clear every entity's every counter delta, totals preserved.
    pub fn reset_deltas(&mut self) {
        self.node.resources.reset_delta();
        self.node.energy.reset_delta();
        for collection in self.node.absolute.values_mut() {
            collection.reset_delta();
        }
        for p in self.processes.values_mut() {
            p.resources.reset_delta();
            p.energy.reset_delta();
        }
        for c in self.containers.values_mut() {
            c.resources.reset_delta();
            c.energy.reset_delta();
        }
        for pod in self.pods.values_mut() {
            pod.resources.reset_delta();
            pod.energy.reset_delta();
        }
        for vm in self.vms.values_mut() {
            vm.resources.reset_delta();
            vm.energy.reset_delta();
        }
    }

    pub fn ensure_container(&mut self, info: &ContainerInfo) -> &mut Container {
        if !info.is_sentinel() {
            let pod_key = format!("{}/{}", info.namespace, info.pod_name);
            self.pods.entry(pod_key).or_insert_with(|| Pod {
                namespace: info.namespace.clone(),
                name: info.pod_name.clone(),
                resources: ResourceCounters::default(),
                energy: EnergyUsage::default(),
            });
        }
        self.containers.entry(info.id.clone()).or_insert_with(|| {
            Container::new(
                info.id.clone(),
                info.name.clone(),
                info.namespace.clone(),
                info.pod_name.clone(),
            )
        })
    }

    pub fn ensure_vm(&mut self, vm: &VmInfo) -> &mut VirtualMachine {
        self.vms.entry(vm.id.clone()).or_insert_with(|| VirtualMachine {
            id: vm.id.clone(),
            name: vm.name.clone(),
            pid: 0,
            resources: ResourceCounters::default(),
            energy: EnergyUsage::default(),
            ticks_without_processes: 0,
        })
    }

    /// Phase E: fold one probe record into its process entity.
    ///
    /// Kernel-owned records collapse into the synthetic kernel process
    /// (pid 1); system-owned records collapse into a single system process
    /// only when `merge_system` is set. Returns the effective pid the
    /// record was stored under.
    pub fn ingest_record(
        &mut self,
        record: &ProcessRecord,
        resolution: &Resolution,
        merge_system: bool,
        registry: &MetricRegistry,
        fallback_command: Option<&str>,
    ) -> u32 {
        let (pid, owner, command_override) = match resolution {
            Resolution::Container(info) if info.id == KERNEL_ID => (
                KERNEL_PID,
                Owner::Container(info.id.clone()),
                Some("kernel_processes"),
            ),
            Resolution::Container(info) if info.id == SYSTEM_ID && merge_system => (
                SYSTEM_PID,
                Owner::Container(info.id.clone()),
                Some("system_processes"),
            ),
            Resolution::Container(info) => (record.pid, Owner::Container(info.id.clone()), None),
            Resolution::Vm(vm) => (record.pid, Owner::Vm(vm.id.clone()), None),
        };

        match resolution {
            Resolution::Container(info) => {
                self.ensure_container(info);
            }
            Resolution::Vm(vm) => {
                let entry = self.ensure_vm(vm);
                if entry.pid == 0 {
                    entry.pid = record.pid;
                }
            }
        }

        let process = self
            .processes
            .entry(pid)
            .or_insert_with(|| Process::new(pid, owner.clone()));
        process.owner = owner;
        process.idle_ticks = 0;
        process.freed = false;

        // The command is preserved if a later tick sees the same pid with
        // an unknown comm.
        let command = command_override
            .map(str::to_string)
            .unwrap_or_else(|| record.command());
        let command = if command.is_empty() {
            fallback_command.unwrap_or_default().to_string()
        } else {
            command
        };
        if !command.is_empty() {
            process.command = command;
        }

        let values = [
            (ResourceMetric::CpuRunTimeMs, record.cpu_run_time_ms),
            (ResourceMetric::TaskClockMs, record.task_clock_ms),
            (ResourceMetric::CpuCycles, record.cpu_cycles),
            (ResourceMetric::CpuInstructions, record.cpu_instructions),
            (ResourceMetric::CacheMisses, record.cache_misses),
            (ResourceMetric::PageCacheHits, record.page_cache_hits),
        ];
        for (metric, value) in values {
            if value > 0 && registry.contains(metric) {
                if let Err(e) = process.resources.add_delta(metric, value) {
                    tracing::debug!(pid, metric = %metric, error = %e, "counter signal during ingest");
                }
            }
        }
        if registry.contains(ResourceMetric::SoftIrq) {
            for (vector, &count) in SOFT_IRQ_NAMES.iter().copied().zip(record.soft_irq_counts.iter()) {
                if count > 0 {
                    if let Err(e) = process.resources.add_soft_irq(vector, count) {
                        tracing::debug!(pid, vector, error = %e, "soft irq counter signal");
                    }
                }
            }
        }

        pid
    }

    /// Phase D ingest: accelerator utilization for a pid already in the
    /// process table. Unknown pids are skipped; their usage shows up as
    /// residual during attribution.
    pub fn add_gpu_utilization(
        &mut self,
        pid: u32,
        util: ProcessUtilization,
        registry: &MetricRegistry,
    ) {
        if !registry.contains(ResourceMetric::GpuSmUtil) {
            return;
        }
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if util.sm_util > 0 {
            let _ = process.resources.add_delta(ResourceMetric::GpuSmUtil, util.sm_util);
        }
        if util.mem_util > 0 {
            let _ = process
                .resources
                .add_delta(ResourceMetric::GpuMemUtil, util.mem_util);
        }
    }

    /// Phase B result: fold per-socket component counters into the node's
    /// absolute collections. Rollover is absorbed by `set_aggregate`.
    pub fn apply_component_energy(&mut self, reading: &ComponentReading) {
        for (socket, energy) in reading {
            let pairs = [
                (Component::Pkg, energy.pkg),
                (Component::Core, energy.core),
                (Component::Uncore, energy.uncore),
                (Component::Dram, energy.dram),
            ];
            for (component, millijoules) in pairs {
                // Hosts without a core/uncore/dram subzone report zero for
                // it; don't grow a permanently-zero member.
                let subzone = matches!(
                    component,
                    Component::Core | Component::Uncore | Component::Dram
                );
                let known = self
                    .node
                    .absolute
                    .get(&component)
                    .is_some_and(|c| c.member(socket).is_some());
                if millijoules == 0 && subzone && !known {
                    continue;
                }
                if let Err(e) = self
                    .node
                    .absolute_mut(component)
                    .set_aggregate(socket, millijoules)
                {
                    tracing::debug!(socket = %socket, component = %component, error = %e, "energy counter signal");
                }
            }
        }
    }

    /// Phase C result: whole-node platform sensors.
    pub fn apply_platform_energy(&mut self, reading: &PlatformReading) {
        for (sensor, &millijoules) in reading {
            if let Err(e) = self
                .node
                .absolute_mut(Component::Platform)
                .set_aggregate(sensor, millijoules)
            {
                tracing::debug!(sensor = %sensor, error = %e, "platform energy counter signal");
            }
        }
    }

    /// Phase D result: cumulative accelerator device energy.
    pub fn apply_gpu_energy(&mut self, reading: &PlatformReading) {
        for (device, &millijoules) in reading {
            if let Err(e) = self
                .node
                .absolute_mut(Component::Gpu)
                .set_aggregate(device, millijoules)
            {
                tracing::debug!(device = %device, error = %e, "gpu energy counter signal");
            }
        }
    }

    /// Roll per-process resource deltas up into the owning container or VM,
    /// its pod, and the node, for every registry metric.
    ///
    /// Rollup is additive on `delta`; each owner's `total` evolves from its
    /// own `add_delta` history, preserving monotonicity across process
    /// churn.
    pub fn aggregate_process_resources(&mut self, registry: &MetricRegistry) {
        let pids: Vec<u32> = self.processes.keys().copied().collect();
        for pid in pids {
            let (owner, deltas, irq) = {
                let p = &self.processes[&pid];
                let deltas: Vec<(ResourceMetric, u64)> = registry
                    .metrics()
                    .iter()
                    .filter(|&&m| m != ResourceMetric::SoftIrq)
                    .map(|&m| (m, p.resources.delta(m)))
                    .filter(|&(_, d)| d > 0)
                    .collect();
                let irq: Vec<(String, u64)> = p
                    .resources
                    .soft_irq()
                    .iter()
                    .map(|(name, c)| (name.to_string(), c.delta()))
                    .filter(|&(_, d)| d > 0)
                    .collect();
                (p.owner.clone(), deltas, irq)
            };

            match &owner {
                Owner::Container(id) => {
                    let pod_key = self.containers.get(id).map(Container::pod_key);
                    if let Some(container) = self.containers.get_mut(id) {
                        roll_into(&mut container.resources, &deltas, &irq);
                    }
                    if let Some(pod) = pod_key.and_then(|k| self.pods.get_mut(&k)) {
                        roll_into(&mut pod.resources, &deltas, &irq);
                    }
                }
                Owner::Vm(id) => {
                    if let Some(vm) = self.vms.get_mut(id) {
                        roll_into(&mut vm.resources, &deltas, &irq);
                    }
                }
            }
            roll_into(&mut self.node.resources, &deltas, &irq);
        }
    }

    /// Advance idle counters after ingest: pids seen this tick reset to
    /// zero, everything else ages by one; freed pids are flagged for GC.
    pub fn mark_idle_and_freed(&mut self, seen: &HashSet<u32>, freed: &[u32]) {
        for (pid, process) in &mut self.processes {
            if !seen.contains(pid) {
                process.idle_ticks = process.idle_ticks.saturating_add(1);
            }
        }
        for pid in freed {
            if let Some(process) = self.processes.get_mut(pid) {
                process.freed = true;
            }
        }
    }

    /// Phase G. Drops processes the kernel freed, idle processes whose
    /// container is gone, containers/VMs with no live child for the grace
    /// period, and pods left without containers. Aggregated totals that
    /// were rolled upward are retained by their owners.
    pub fn gc(
        &mut self,
        is_alive: impl Fn(&str) -> bool,
        idle_threshold: u32,
        grace_ticks: u32,
    ) {
        self.processes.retain(|_, p| {
            if p.freed {
                return false;
            }
            let owner_alive = match &p.owner {
                Owner::Container(id) => is_alive(id),
                Owner::Vm(_) => true,
            };
            !(p.idle_ticks >= idle_threshold && !owner_alive)
        });

        // Live child = appeared in this tick's probe batch.
        let mut live_containers: HashSet<String> = HashSet::new();
        let mut live_vms: HashSet<String> = HashSet::new();
        for p in self.processes.values() {
            if p.idle_ticks == 0 {
                match &p.owner {
                    Owner::Container(id) => {
                        live_containers.insert(id.clone());
                    }
                    Owner::Vm(id) => {
                        live_vms.insert(id.clone());
                    }
                }
            }
        }

        let mut removed_containers: Vec<String> = Vec::new();
        for (id, container) in &mut self.containers {
            if live_containers.contains(id.as_str()) {
                container.ticks_without_processes = 0;
            } else {
                container.ticks_without_processes =
                    container.ticks_without_processes.saturating_add(1);
            }
            if container.ticks_without_processes >= grace_ticks && !is_alive(id) {
                removed_containers.push(id.clone());
            }
        }
        for id in &removed_containers {
            self.containers.remove(id);
            tracing::debug!(container_id = %id, "garbage collected container");
        }
        if !removed_containers.is_empty() {
            // Cascade: orphaned processes of removed containers go too.
            let remaining: HashSet<String> = self.containers.keys().cloned().collect();
            self.processes.retain(|_, p| match &p.owner {
                Owner::Container(id) => remaining.contains(id) || is_alive(id),
                Owner::Vm(_) => true,
            });
        }

        self.vms.retain(|id, vm| {
            if live_vms.contains(id.as_str()) {
                vm.ticks_without_processes = 0;
            } else {
                vm.ticks_without_processes = vm.ticks_without_processes.saturating_add(1);
            }
            vm.ticks_without_processes < grace_ticks
        });

        // Pods live as long as one of their containers does.
        let referenced: HashSet<String> =
            self.containers.values().map(Container::pod_key).collect();
        self.pods.retain(|key, _| referenced.contains(key));
    }
}

fn roll_into(
    target: &mut ResourceCounters,
    deltas: &[(ResourceMetric, u64)],
    irq: &[(String, u64)],
) {
    for &(metric, delta) in deltas {
        if let Err(e) = target.add_delta(metric, delta) {
            tracing::debug!(metric = %metric, error = %e, "counter signal during rollup");
        }
    }
    for (vector, delta) in irq {
        if let Err(e) = target.add_soft_irq(vector, *delta) {
            tracing::debug!(vector = %vector, error = %e, "counter signal during rollup");
        }
    }
}

/// The tick lock and the data it guards.
pub struct StatsStore {
    data: RwLock<StoreData>,
}

impl StatsStore {
    pub fn new(data: StoreData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Exclusive access for the collector; held across a whole tick.
    pub async fn write(&self) -> RwLockWriteGuard<'_, StoreData> {
        self.data.write().await
    }

    /// Shared access for scrape snapshots.
    pub async fn read(&self) -> RwLockReadGuard<'_, StoreData> {
        self.data.read().await
    }
}
