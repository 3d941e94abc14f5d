//! Scrape exporter.
//!
//! Stateless over the stats store: each scrape takes the read half of the
//! tick lock, renders the current entity tables into a Prometheus text
//! exposition and releases the lock. Families are registered from the live
//! metric registry, so disabled sources yield absent series rather than
//! zero-valued ones. Metric children are sorted by label signature, making
//! consecutive scrapes between ticks byte-identical.
//!
//! Energy renders as a counter/gauge pair per scope and component:
//! `<ns>_<scope>_<component>_joules_total` (lifetime) and
//! `<ns>_<scope>_<component>_joules` (last tick). Internal milli-joules
//! divide by 1000 on the way out.

mod server;

pub use server::{serve, ServerOptions};

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::metrics::{Component, Mode, ResourceMetric};
use crate::store::{ResourceCounters, StatsStore, StoreData};

/// Fixed metric namespace; not user-configurable.
pub const NAMESPACE: &str = "wattscope";

const MILLIJOULES_PER_JOULE: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub process_metrics: bool,
    pub vm_metrics: bool,
    /// Resource metrics active for this run.
    pub resource_metrics: Vec<ResourceMetric>,
}

pub struct Exporter {
    store: Arc<StatsStore>,
    options: ExportOptions,
}

impl Exporter {
    pub fn new(store: Arc<StatsStore>, options: ExportOptions) -> Self {
        Self { store, options }
    }

    /// Render a scrape under the shared tick lock.
    pub async fn render(&self) -> anyhow::Result<String> {
        let data = self.store.read().await;
        render_data(&data, &self.options)
    }
}

/// Build and encode the full exposition for one snapshot.
pub fn render_data(data: &StoreData, options: &ExportOptions) -> anyhow::Result<String> {
    let registry = Registry::new();
    let emit = Emitter { registry: &registry };

    emit.node(data, options)?;
    emit.containers(data, options)?;
    emit.pods(data)?;
    if options.vm_metrics {
        emit.vms(data, options)?;
    }
    if options.process_metrics {
        emit.processes(data, options)?;
    }

    encode_sorted(&registry)
}

/// One entity row: its label values plus its resource counters.
type ResourceRow<'a> = (Vec<String>, &'a ResourceCounters);

struct Emitter<'r> {
    registry: &'r Registry,
}

impl Emitter<'_> {
    fn counter_family(
        &self,
        name: String,
        help: String,
        labels: &[&str],
    ) -> anyhow::Result<CounterVec> {
        let vec = CounterVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(vec.clone()))?;
        Ok(vec)
    }

    fn int_counter_family(
        &self,
        name: String,
        help: String,
        labels: &[&str],
    ) -> anyhow::Result<IntCounterVec> {
        let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(vec.clone()))?;
        Ok(vec)
    }

    fn gauge_family(&self, name: String, help: String, labels: &[&str]) -> anyhow::Result<GaugeVec> {
        let vec = GaugeVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(vec.clone()))?;
        Ok(vec)
    }

    /// Counter/gauge pair for one scope and component.
    fn energy_pair(
        &self,
        scope: &str,
        component: Component,
        labels: &[&str],
    ) -> anyhow::Result<(CounterVec, GaugeVec)> {
        let measure = component.as_str();
        let total = self.counter_family(
            format!("{NAMESPACE}_{scope}_{measure}_joules_total"),
            format!("Attributed {measure} energy per {scope} in joules"),
            labels,
        )?;
        let last = self.gauge_family(
            format!("{NAMESPACE}_{scope}_{measure}_joules"),
            format!("Attributed {measure} energy per {scope} over the last tick, joules"),
            labels,
        )?;
        Ok((total, last))
    }

    /// Emit the registry's resource counters for one entity scope.
    ///
    /// Accelerator utilization is a per-process gauge and is skipped here;
    /// soft IRQ counts fan out over an extra `irq` label.
    fn emit_resources(
        &self,
        scope: &str,
        label_names: &[&str],
        rows: &[ResourceRow<'_>],
        metrics: &[ResourceMetric],
    ) -> anyhow::Result<()> {
        for &metric in metrics {
            match metric {
                ResourceMetric::GpuSmUtil | ResourceMetric::GpuMemUtil => continue,
                ResourceMetric::SoftIrq => {
                    let mut labels = label_names.to_vec();
                    labels.push("irq");
                    let vec = self.int_counter_family(
                        format!("{NAMESPACE}_{scope}_{}_total", metric.export_name()),
                        format!("Cumulative {} per {scope}", metric.export_name()),
                        &labels,
                    )?;
                    for (values, resources) in rows {
                        for (vector, counter) in resources.soft_irq().iter() {
                            let mut vals: Vec<&str> =
                                values.iter().map(String::as_str).collect();
                            vals.push(vector);
                            vec.with_label_values(&vals).inc_by(counter.total());
                        }
                    }
                }
                _ => {
                    let vec = self.int_counter_family(
                        format!("{NAMESPACE}_{scope}_{}_total", metric.export_name()),
                        format!("Cumulative {} per {scope}", metric.export_name()),
                        label_names,
                    )?;
                    for (values, resources) in rows {
                        let total = resources.total(metric);
                        if total > 0 {
                            let vals: Vec<&str> =
                                values.iter().map(String::as_str).collect();
                            vec.with_label_values(&vals).inc_by(total);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn node(&self, data: &StoreData, options: &ExportOptions) -> anyhow::Result<()> {
        let instance = data.node.name.as_str();

        let info = self.gauge_family(
            format!("{NAMESPACE}_node_info"),
            "Node identity".to_string(),
            &["instance", "cpu_architecture"],
        )?;
        info.with_label_values(&[instance, &data.node.cpu_architecture])
            .set(1.0);

        let build = self.gauge_family(
            format!("{NAMESPACE}_build_info"),
            "Agent build information".to_string(),
            &["version"],
        )?;
        build
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1.0);

        for component in Component::ALL {
            if !data.node.absolute.contains_key(&component) {
                continue;
            }
            let (total, last) = self.energy_pair("node", component, &["instance", "mode"])?;
            for mode in Mode::ALL {
                total
                    .with_label_values(&[instance, mode.as_str()])
                    .inc_by(data.node.energy.total(component, mode) as f64 / MILLIJOULES_PER_JOULE);
                last.with_label_values(&[instance, mode.as_str()])
                    .set(data.node.energy.delta(component, mode) as f64 / MILLIJOULES_PER_JOULE);
            }

            // Raw per-member counters keep the source detail: package-class
            // components get a socket label, gpu a device label, platform a
            // sensor label.
            let member_label = match component {
                Component::Pkg | Component::Core | Component::Uncore | Component::Dram => "package",
                Component::Gpu => "gpu",
                _ => "source",
            };
            let absolute = self.counter_family(
                format!(
                    "{NAMESPACE}_node_{}_absolute_joules_total",
                    component.as_str()
                ),
                format!(
                    "Raw cumulative {} energy per source, joules",
                    component.as_str()
                ),
                &["instance", member_label],
            )?;
            if let Some(collection) = data.node.absolute.get(&component) {
                for (member, counter) in collection.iter() {
                    absolute
                        .with_label_values(&[instance, member])
                        .inc_by(counter.total() as f64 / MILLIJOULES_PER_JOULE);
                }
            }
        }

        let rows: Vec<ResourceRow<'_>> =
            vec![(vec![instance.to_string()], &data.node.resources)];
        self.emit_resources("node", &["instance"], &rows, &options.resource_metrics)
    }

    fn containers(&self, data: &StoreData, options: &ExportOptions) -> anyhow::Result<()> {
        const LABELS: [&str; 5] = [
            "container_id",
            "pod_name",
            "container_name",
            "container_namespace",
            "mode",
        ];
        for component in Component::ALL {
            let any = data.containers.values().any(|c| {
                c.energy.total(component, Mode::Dynamic) > 0
                    || c.energy.total(component, Mode::Idle) > 0
            });
            if !any {
                continue;
            }
            let (total_vec, last_vec) = self.energy_pair("container", component, &LABELS)?;
            for container in data.containers.values() {
                for mode in Mode::ALL {
                    let total = container.energy.total(component, mode);
                    if total == 0 && mode == Mode::Idle {
                        continue;
                    }
                    let labels = [
                        container.id.as_str(),
                        container.pod_name.as_str(),
                        container.name.as_str(),
                        container.namespace.as_str(),
                        mode.as_str(),
                    ];
                    total_vec
                        .with_label_values(&labels)
                        .inc_by(total as f64 / MILLIJOULES_PER_JOULE);
                    last_vec.with_label_values(&labels).set(
                        container.energy.delta(component, mode) as f64 / MILLIJOULES_PER_JOULE,
                    );
                }
            }
        }

        let rows: Vec<ResourceRow<'_>> = data
            .containers
            .values()
            .map(|c| {
                (
                    vec![
                        c.id.clone(),
                        c.pod_name.clone(),
                        c.name.clone(),
                        c.namespace.clone(),
                    ],
                    &c.resources,
                )
            })
            .collect();
        self.emit_resources(
            "container",
            &["container_id", "pod_name", "container_name", "container_namespace"],
            &rows,
            &options.resource_metrics,
        )
    }

    fn pods(&self, data: &StoreData) -> anyhow::Result<()> {
        const LABELS: [&str; 3] = ["pod_name", "pod_namespace", "mode"];
        for component in Component::ALL {
            let any = data.pods.values().any(|p| {
                p.energy.total(component, Mode::Dynamic) > 0
                    || p.energy.total(component, Mode::Idle) > 0
            });
            if !any {
                continue;
            }
            let (total_vec, last_vec) = self.energy_pair("pod", component, &LABELS)?;
            for pod in data.pods.values() {
                for mode in Mode::ALL {
                    let total = pod.energy.total(component, mode);
                    if total == 0 && mode == Mode::Idle {
                        continue;
                    }
                    let labels = [pod.name.as_str(), pod.namespace.as_str(), mode.as_str()];
                    total_vec
                        .with_label_values(&labels)
                        .inc_by(total as f64 / MILLIJOULES_PER_JOULE);
                    last_vec
                        .with_label_values(&labels)
                        .set(pod.energy.delta(component, mode) as f64 / MILLIJOULES_PER_JOULE);
                }
            }
        }
        Ok(())
    }

    fn vms(&self, data: &StoreData, options: &ExportOptions) -> anyhow::Result<()> {
        const LABELS: [&str; 3] = ["pid", "name", "mode"];
        for component in Component::ALL {
            let any = data
                .vms
                .values()
                .any(|vm| vm.energy.total(component, Mode::Dynamic) > 0);
            if !any {
                continue;
            }
            let (total_vec, last_vec) = self.energy_pair("vm", component, &LABELS)?;
            for vm in data.vms.values() {
                let pid = vm.pid.to_string();
                for mode in Mode::ALL {
                    let total = vm.energy.total(component, mode);
                    if total == 0 && mode == Mode::Idle {
                        continue;
                    }
                    let labels = [pid.as_str(), vm.name.as_str(), mode.as_str()];
                    total_vec
                        .with_label_values(&labels)
                        .inc_by(total as f64 / MILLIJOULES_PER_JOULE);
                    last_vec
                        .with_label_values(&labels)
                        .set(vm.energy.delta(component, mode) as f64 / MILLIJOULES_PER_JOULE);
                }
            }
        }

        let rows: Vec<ResourceRow<'_>> = data
            .vms
            .values()
            .map(|vm| (vec![vm.pid.to_string(), vm.name.clone()], &vm.resources))
            .collect();
        self.emit_resources("vm", &["pid", "name"], &rows, &options.resource_metrics)
    }

    fn processes(&self, data: &StoreData, options: &ExportOptions) -> anyhow::Result<()> {
        for component in Component::ALL {
            let any = data
                .processes
                .values()
                .any(|p| p.energy.total(component, Mode::Dynamic) > 0);
            if !any {
                continue;
            }
            let (total_vec, last_vec) =
                self.energy_pair("process", component, &["pid", "command", "mode"])?;
            for process in data.processes.values() {
                let total = process.energy.total(component, Mode::Dynamic);
                if total == 0 {
                    continue;
                }
                let pid = process.pid.to_string();
                let labels = [pid.as_str(), process.command.as_str(), Mode::Dynamic.as_str()];
                total_vec
                    .with_label_values(&labels)
                    .inc_by(total as f64 / MILLIJOULES_PER_JOULE);
                last_vec.with_label_values(&labels).set(
                    process.energy.delta(component, Mode::Dynamic) as f64 / MILLIJOULES_PER_JOULE,
                );
            }
        }

        let rows: Vec<ResourceRow<'_>> = data
            .processes
            .values()
            .map(|p| (vec![p.pid.to_string(), p.command.clone()], &p.resources))
            .collect();
        self.emit_resources("process", &["pid", "command"], &rows, &options.resource_metrics)?;

        // Accelerator utilization gauges, per process.
        for &metric in &options.resource_metrics {
            if !matches!(
                metric,
                ResourceMetric::GpuSmUtil | ResourceMetric::GpuMemUtil
            ) {
                continue;
            }
            let vec = self.gauge_family(
                format!("{NAMESPACE}_process_{}", metric.export_name()),
                "Accelerator utilization over the last tick, percent".to_string(),
                &["pid", "command"],
            )?;
            for process in data.processes.values() {
                let delta = process.resources.delta(metric);
                if delta > 0 {
                    vec.with_label_values(&[&process.pid.to_string(), &process.command])
                        .set(delta as f64);
                }
            }
        }

        Ok(())
    }
}

/// Encode with families and children in a stable order so repeated scrapes
/// of the same snapshot are byte-identical.
fn encode_sorted(registry: &Registry) -> anyhow::Result<String> {
    let mut families = registry.gather();
    families.sort_by(|a, b| a.get_name().cmp(b.get_name()));
    for family in &mut families {
        family.mut_metric().sort_by(|a, b| {
            let sig = |m: &prometheus::proto::Metric| {
                m.get_label()
                    .iter()
                    .map(|l| format!("{}={}", l.get_name(), l.get_value()))
                    .collect::<Vec<_>>()
                    .join(",")
            };
            sig(a).cmp(&sig(b))
        });
    }
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricRegistry;
    use crate::probe::ProcessRecord;
    use crate::resolver::{ContainerInfo, Resolution};
    use crate::store::StoreData;

    const CID: &str = "19ec54f00502d7236ff37726115196c61a23301c69badddf7838516a03f69e08";

    fn options() -> ExportOptions {
        ExportOptions {
            process_metrics: true,
            vm_metrics: true,
            resource_metrics: vec![
                ResourceMetric::CpuRunTimeMs,
                ResourceMetric::CpuInstructions,
            ],
        }
    }

    fn populated_data() -> StoreData {
        let mut data = StoreData::new("node-1".into(), "x86_64".into());
        let registry = MetricRegistry::new(
            &[ResourceMetric::CpuRunTimeMs, ResourceMetric::CpuInstructions],
            false,
            false,
        );
        let info = ContainerInfo {
            id: CID.to_string(),
            name: "web".to_string(),
            namespace: "prod".to_string(),
            pod_name: "web-abc12".to_string(),
        };
        let record = ProcessRecord {
            pid: 100,
            tid: 100,
            cpu_run_time_ms: 25,
            cpu_instructions: 9000,
            ..Default::default()
        }
        .with_command("nginx");
        data.ingest_record(&record, &Resolution::Container(info), false, &registry, None);
        data.aggregate_process_resources(&registry);
        data.containers
            .get_mut(CID)
            .unwrap()
            .energy
            .add_delta(Component::Pkg, Mode::Dynamic, 2_500)
            .unwrap();
        data.node
            .absolute_mut(Component::Pkg)
            .set_aggregate("0", 10_000)
            .unwrap();
        data.node
            .energy
            .add_delta(Component::Pkg, Mode::Dynamic, 2_500)
            .unwrap();
        data
    }

    #[test]
    fn renders_expected_series() {
        let output = render_data(&populated_data(), &options()).unwrap();
        assert!(output
            .contains("wattscope_node_info{cpu_architecture=\"x86_64\",instance=\"node-1\"} 1"));
        assert!(output.contains("wattscope_container_package_joules_total"));
        assert!(output.contains("container_id=\"19ec54f"));
        assert!(output.contains("mode=\"dynamic\""));
        // Joule conversion: 2500 mJ -> 2.5 J.
        assert!(output.contains("2.5"));
        assert!(output.contains("wattscope_node_package_absolute_joules_total"));
        assert!(output.contains("wattscope_build_info"));
    }

    #[test]
    fn resource_counters_appear_at_every_scope() {
        let output = render_data(&populated_data(), &options()).unwrap();
        assert!(output.contains("wattscope_node_cpu_instructions_total{instance=\"node-1\"} 9000"));
        assert!(output.contains("wattscope_container_cpu_instructions_total"));
        assert!(output.contains("wattscope_process_cpu_instructions_total"));
        assert!(output.contains("command=\"nginx\""));
        assert!(output.contains("wattscope_process_cpu_time_milliseconds_total"));
    }

    #[test]
    fn energy_renders_as_counter_gauge_pair() {
        let output = render_data(&populated_data(), &options()).unwrap();
        // The gauge carries the last-tick delta, the counter the lifetime
        // total; right after the tick both read 2.5 joules.
        assert!(output.contains("# TYPE wattscope_container_package_joules gauge"));
        assert!(output.contains("# TYPE wattscope_container_package_joules_total counter"));
    }

    #[test]
    fn disabled_families_are_absent() {
        let mut opts = options();
        opts.process_metrics = false;
        opts.resource_metrics.clear();
        let output = render_data(&populated_data(), &opts).unwrap();
        assert!(!output.contains("wattscope_process_"));
        assert!(!output.contains("wattscope_node_cpu_instructions_total"));
    }

    #[test]
    fn consecutive_renders_are_byte_identical() {
        let data = populated_data();
        let opts = options();
        let a = render_data(&data, &opts).unwrap();
        let b = render_data(&data, &opts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sentinel_containers_render_with_their_namespace() {
        let mut data = populated_data();
        let system = data
            .containers
            .entry(crate::resolver::SYSTEM_ID.to_string())
            .or_insert_with(|| {
                crate::store::Container::new(
                    "system".into(),
                    "system_processes".into(),
                    "system".into(),
                    "system_processes".into(),
                )
            });
        system
            .energy
            .add_delta(Component::Pkg, Mode::Dynamic, 1_000)
            .unwrap();
        let output = render_data(&data, &options()).unwrap();
        assert!(output.contains("container_namespace=\"system\""));
    }
}
