//! The sampling loop.
//!
//! One long-lived task drives a tick per sample interval. Within a tick the
//! four source reads (probes, component energy, platform energy,
//! accelerator) fan out concurrently and join at a barrier; ingest,
//! attribution and GC then run serially. The whole tick holds the write
//! half of the tick lock, so a scrape observes either the previous tick or
//! the complete current one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::accel::{AcceleratorSource, DeviceEnergyReading, ProcessUtilization};
use crate::energy::{ComponentEnergySource, ComponentReading, PlatformEnergySource, PlatformReading};
use crate::error::SourceError;
use crate::metrics::MetricRegistry;
use crate::power::PowerModel;
use crate::probe::{ProbeBatch, ProbeExporter};
use crate::resolver::Resolver;
use crate::store::StatsStore;

/// Deadline for any single source read within a tick; a timeout counts as
/// "source returned empty" for the tick.
pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

pub type SharedProbe = Arc<Mutex<Box<dyn ProbeExporter>>>;
pub type SharedComponentSource = Arc<Mutex<Box<dyn ComponentEnergySource>>>;
pub type SharedPlatformSource = Arc<Mutex<Box<dyn PlatformEnergySource>>>;
pub type SharedAccelerator = Arc<Mutex<Box<dyn AcceleratorSource>>>;

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub sample_interval: Duration,
    pub use_cgroup_id: bool,
    pub merge_system: bool,
    /// Ticks a process may sit idle before it becomes a GC candidate.
    pub proc_idle_ticks: u32,
    /// Ticks a container/VM may run process-less before GC.
    pub grace_ticks: u32,
    /// Consecutive failures after which a source is disabled for the
    /// process lifetime.
    pub max_source_failures: u32,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(3),
            use_cgroup_id: false,
            merge_system: false,
            proc_idle_ticks: 20,
            grace_ticks: 10,
            max_source_failures: 5,
        }
    }
}

/// Consecutive-failure budget for one source.
struct FailureBudget {
    name: &'static str,
    consecutive: u32,
    disabled: bool,
}

impl FailureBudget {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            consecutive: 0,
            disabled: false,
        }
    }

    /// Fold a source result into the budget; `None` means the tick sees an
    /// empty reading.
    fn admit<T>(&mut self, max: u32, result: Option<Result<T, SourceError>>) -> Option<T> {
        match result? {
            Ok(value) => {
                self.consecutive = 0;
                Some(value)
            }
            Err(e) => {
                self.consecutive += 1;
                tracing::warn!(
                    source = self.name,
                    consecutive = self.consecutive,
                    error = %e,
                    "source failed, tick proceeds without it"
                );
                if self.consecutive >= max && !self.disabled {
                    self.disabled = true;
                    tracing::error!(
                        source = self.name,
                        "source exceeded failure budget, disabled for process lifetime"
                    );
                }
                None
            }
        }
    }
}

pub struct Collector {
    store: Arc<StatsStore>,
    resolver: Arc<Resolver>,
    registry: MetricRegistry,
    model: PowerModel,
    options: CollectorOptions,
    probe: SharedProbe,
    component_source: Option<SharedComponentSource>,
    platform_source: Option<SharedPlatformSource>,
    accelerator: Option<SharedAccelerator>,
    probe_budget: FailureBudget,
    component_budget: FailureBudget,
    platform_budget: FailureBudget,
    accelerator_budget: FailureBudget,
    last_tick: Option<Instant>,
}

impl Collector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StatsStore>,
        resolver: Arc<Resolver>,
        registry: MetricRegistry,
        model: PowerModel,
        options: CollectorOptions,
        probe: Box<dyn ProbeExporter>,
        component_source: Option<Box<dyn ComponentEnergySource>>,
        platform_source: Option<Box<dyn PlatformEnergySource>>,
        accelerator: Option<Box<dyn AcceleratorSource>>,
    ) -> Self {
        Self {
            store,
            resolver,
            registry,
            model,
            options,
            probe: Arc::new(Mutex::new(probe)),
            component_source: component_source.map(|s| Arc::new(Mutex::new(s))),
            platform_source: platform_source.map(|s| Arc::new(Mutex::new(s))),
            accelerator: accelerator.map(|s| Arc::new(Mutex::new(s))),
            probe_budget: FailureBudget::new("probe"),
            component_budget: FailureBudget::new("component-energy"),
            platform_budget: FailureBudget::new("platform-energy"),
            accelerator_budget: FailureBudget::new("accelerator"),
            last_tick: None,
        }
    }

    /// Run the tick loop until shutdown. An in-flight tick always completes;
    /// the cancellation signal is observed between ticks. A tick that
    /// overruns the interval re-enters immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.probe.lock().expect("probe lock poisoned").start() {
            tracing::warn!(error = %e, "probe start failed, running without probe data");
        }
        let interval = self.options.sample_interval;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            self.tick().await;
            let elapsed = started.elapsed();
            if elapsed >= interval {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = interval.as_millis() as u64,
                    "tick overran the sample interval, re-entering immediately"
                );
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval - elapsed) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.probe.lock().expect("probe lock poisoned").stop();
        tracing::info!("collector stopped");
    }

    /// One tick, phases 0 through G.
    pub async fn tick(&mut self) {
        let elapsed = self
            .last_tick
            .map(|t| t.elapsed())
            .unwrap_or(self.options.sample_interval);
        self.last_tick = Some(Instant::now());

        let mut data = self.store.write().await;

        // Phase 0: reset every delta before any source result lands.
        data.reset_deltas();

        // Phases A-D: concurrent source reads joined here.
        let (probe_res, component_res, platform_res, accel_res) = tokio::join!(
            read_probe(self.probe_if_enabled()),
            read_components(self.component_if_enabled()),
            read_platform(self.platform_if_enabled()),
            read_accelerator(self.accelerator_if_enabled(), elapsed),
        );

        let max = self.options.max_source_failures;
        let batch = self.probe_budget.admit(max, probe_res);
        let components = self.component_budget.admit(max, component_res);
        let platform = self.platform_budget.admit(max, platform_res);
        let accel = self.accelerator_budget.admit(max, accel_res);

        // Phase E: ingest and resolve, then roll resources upward.
        let mut seen: HashSet<u32> = HashSet::new();
        let mut freed: Vec<u32> = Vec::new();
        if let Some(batch) = batch {
            for record in &batch.records {
                let resolution =
                    self.resolver
                        .resolve(record.cgroup_id, record.pid, self.options.use_cgroup_id);
                let fallback_comm = if record.command().is_empty() {
                    self.resolver.command_of(record.pid)
                } else {
                    None
                };
                let pid = data.ingest_record(
                    record,
                    &resolution,
                    self.options.merge_system,
                    &self.registry,
                    fallback_comm.as_deref(),
                );
                seen.insert(pid);
            }
            self.resolver.clear(&batch.freed_pids);
            freed = batch.freed_pids;
        }
        if let Some((utilization, device_energy)) = accel {
            for (pid, util) in utilization {
                data.add_gpu_utilization(pid, util, &self.registry);
            }
            data.apply_gpu_energy(&device_energy);
        }
        if let Some(reading) = components {
            data.apply_component_energy(&reading);
        }
        if let Some(reading) = platform {
            data.apply_platform_energy(&reading);
        }
        data.aggregate_process_resources(&self.registry);

        // Phase F: attribution.
        self.model.attribute(&mut data);

        // Phase G: garbage collection.
        data.mark_idle_and_freed(&seen, &freed);
        let resolver = Arc::clone(&self.resolver);
        data.gc(
            |id| resolver.is_alive(id),
            self.options.proc_idle_ticks,
            self.options.grace_ticks,
        );
    }

    fn probe_if_enabled(&self) -> Option<SharedProbe> {
        (!self.probe_budget.disabled).then(|| Arc::clone(&self.probe))
    }

    fn component_if_enabled(&self) -> Option<SharedComponentSource> {
        if self.component_budget.disabled {
            return None;
        }
        self.component_source.as_ref().map(Arc::clone)
    }

    fn platform_if_enabled(&self) -> Option<SharedPlatformSource> {
        if self.platform_budget.disabled {
            return None;
        }
        self.platform_source.as_ref().map(Arc::clone)
    }

    fn accelerator_if_enabled(&self) -> Option<SharedAccelerator> {
        if self.accelerator_budget.disabled {
            return None;
        }
        self.accelerator.as_ref().map(Arc::clone)
    }
}

/// Run a blocking source read off the runtime with the tick deadline
/// applied. A deadline miss or panic reads as a source error; the blocking
/// task itself is left to finish in the background.
async fn bounded<T, F>(task: F) -> Result<T, SourceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(task);
    match tokio::time::timeout(SOURCE_TIMEOUT, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(SourceError::Unavailable(format!(
            "source task failed: {join_error}"
        ))),
        Err(_) => Err(SourceError::Unavailable(format!(
            "read exceeded {}s deadline",
            SOURCE_TIMEOUT.as_secs()
        ))),
    }
}

async fn read_probe(probe: Option<SharedProbe>) -> Option<Result<ProbeBatch, SourceError>> {
    let probe = probe?;
    Some(bounded(move || probe.lock().expect("probe lock poisoned").collect()).await)
}

async fn read_components(
    source: Option<SharedComponentSource>,
) -> Option<Result<ComponentReading, SourceError>> {
    let source = source?;
    Some(
        bounded(move || {
            source
                .lock()
                .expect("component source lock poisoned")
                .energy_from_components()
        })
        .await,
    )
}

async fn read_platform(
    source: Option<SharedPlatformSource>,
) -> Option<Result<PlatformReading, SourceError>> {
    let source = source?;
    Some(
        bounded(move || {
            source
                .lock()
                .expect("platform source lock poisoned")
                .energy_from_platform()
        })
        .await,
    )
}

type AccelReading = (FxHashMap<u32, ProcessUtilization>, DeviceEnergyReading);

/// Phase D: per-device utilization summed per pid, plus device energy.
async fn read_accelerator(
    source: Option<SharedAccelerator>,
    elapsed: Duration,
) -> Option<Result<AccelReading, SourceError>> {
    let source = source?;
    Some(
        bounded(move || {
            let mut accel = source.lock().expect("accelerator lock poisoned");
            let mut merged: FxHashMap<u32, ProcessUtilization> = FxHashMap::default();
            for device in accel.devices() {
                let utilization = accel.process_utilization(&device, elapsed)?;
                for (pid, util) in utilization {
                    let entry = merged.entry(pid).or_default();
                    entry.sm_util += util.sm_util;
                    entry.mem_util += util.mem_util;
                }
            }
            let energy = accel.device_energy()?;
            Ok((merged, energy))
        })
        .await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::ReplayComponentSource;
    use crate::metrics::{Component, Mode, ResourceMetric};
    use crate::power::Regressor;
    use crate::probe::{ProcessRecord, ReplayProbe};
    use std::collections::BTreeMap;

    struct FailingComponentSource;

    impl ComponentEnergySource for FailingComponentSource {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn energy_from_components(&mut self) -> Result<ComponentReading, SourceError> {
            Err(SourceError::Unavailable("always down".into()))
        }
    }

    fn collector_with(
        probe: Box<dyn ProbeExporter>,
        component: Option<Box<dyn ComponentEnergySource>>,
        options: CollectorOptions,
    ) -> (Collector, Arc<StatsStore>) {
        let store = Arc::new(StatsStore::new(crate::store::StoreData::new(
            "node-1".into(),
            "x86_64".into(),
        )));
        let resolver = Arc::new(Resolver::new("/nonexistent/proc", "/nonexistent/cgroup"));
        let registry = MetricRegistry::new(
            &[
                ResourceMetric::CpuRunTimeMs,
                ResourceMetric::TaskClockMs,
                ResourceMetric::CpuCycles,
                ResourceMetric::CpuInstructions,
            ],
            false,
            false,
        );
        let model = PowerModel::new(BTreeMap::new(), 60, Regressor::default(), false);
        let collector = Collector::new(
            Arc::clone(&store),
            resolver,
            registry,
            model,
            options,
            probe,
            component,
            None,
            None,
        );
        (collector, store)
    }

    fn kernel_record(pid: u32, instructions: u64) -> ProcessRecord {
        ProcessRecord {
            pid,
            tid: pid,
            cgroup_id: 1,
            cpu_instructions: instructions,
            ..Default::default()
        }
    }

    /// Probe records with cgroup id 1 collapse into the synthetic kernel
    /// process regardless of their real pid.
    #[tokio::test]
    async fn kernel_pids_collapse_into_one_entity() {
        let probe = ReplayProbe::new(vec![ProbeBatch {
            records: vec![kernel_record(1, 1000), kernel_record(2, 500)],
            freed_pids: vec![],
        }]);
        let options = CollectorOptions {
            use_cgroup_id: true,
            ..Default::default()
        };
        let (mut collector, store) = collector_with(Box::new(probe), None, options);
        collector.tick().await;

        let data = store.read().await;
        assert_eq!(data.processes.len(), 1);
        let kernel = &data.processes[&crate::resolver::KERNEL_PID];
        assert_eq!(kernel.resources.delta(ResourceMetric::CpuInstructions), 1500);
        assert_eq!(data.containers[crate::resolver::KERNEL_ID].namespace, "kernel");
    }

    /// A failing source is tolerated per tick and disabled once the
    /// consecutive-failure budget is exhausted.
    #[tokio::test]
    async fn failing_source_is_disabled_after_budget() {
        let options = CollectorOptions {
            max_source_failures: 3,
            ..Default::default()
        };
        let (mut collector, _store) = collector_with(
            Box::new(ReplayProbe::new(vec![])),
            Some(Box::new(FailingComponentSource)),
            options,
        );
        for _ in 0..3 {
            assert!(!collector.component_budget.disabled);
            collector.tick().await;
        }
        assert!(collector.component_budget.disabled);
        // Further ticks skip the source entirely.
        collector.tick().await;
        assert_eq!(collector.component_budget.consecutive, 3);
    }

    /// Full pipeline: probe + energy produce attributed container energy.
    #[tokio::test]
    async fn tick_attributes_energy_end_to_end() {
        let probe = ReplayProbe::new(vec![
            ProbeBatch {
                records: vec![kernel_record(7, 4000)],
                freed_pids: vec![],
            },
            ProbeBatch {
                records: vec![kernel_record(7, 4000)],
                freed_pids: vec![],
            },
        ]);
        let mut first = ComponentReading::new();
        first.insert("0".to_string(), crate::energy::ComponentEnergy {
            pkg: 1_000,
            ..Default::default()
        });
        let mut second = ComponentReading::new();
        second.insert("0".to_string(), crate::energy::ComponentEnergy {
            pkg: 6_000,
            ..Default::default()
        });
        let component = ReplayComponentSource::new(vec![first, second]);

        let options = CollectorOptions {
            use_cgroup_id: true,
            ..Default::default()
        };
        let (mut collector, store) =
            collector_with(Box::new(probe), Some(Box::new(component)), options);

        collector.tick().await;
        collector.tick().await;

        let data = store.read().await;
        // Second tick: 5000 mJ of package delta, all dynamic (still in
        // idle warm-up), attributed to the kernel sentinel's processes.
        assert_eq!(data.node.energy.delta(Component::Pkg, Mode::Dynamic), 5_000);
        assert_eq!(
            data.containers[crate::resolver::KERNEL_ID]
                .energy
                .delta(Component::Pkg, Mode::Dynamic),
            5_000
        );
        let container_sum: u64 = data
            .containers
            .values()
            .map(|c| c.energy.delta(Component::Pkg, Mode::Dynamic))
            .sum();
        assert!(container_sum <= data.node.energy.delta(Component::Pkg, Mode::Dynamic));
    }
}
