//! Fixed registry of resource metrics, energy components and modes.
//!
//! Entities own one counter per registry metric. The registry active for a
//! run is derived from what the probe exporter reports as supported plus the
//! configured feature toggles, so disabled sources yield absent series on
//! the scrape surface rather than zero-valued ones.

use std::fmt;

use serde::Deserialize;

/// A resource-usage signal tracked per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceMetric {
    CpuRunTimeMs,
    TaskClockMs,
    CpuCycles,
    CpuInstructions,
    CacheMisses,
    PageCacheHits,
    SoftIrq,
    GpuSmUtil,
    GpuMemUtil,
}

impl ResourceMetric {
    /// Canonical name, used in configuration and internal keying.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceMetric::CpuRunTimeMs => "cpuRunTimeMs",
            ResourceMetric::TaskClockMs => "taskClockMs",
            ResourceMetric::CpuCycles => "cpuCycles",
            ResourceMetric::CpuInstructions => "cpuInstructions",
            ResourceMetric::CacheMisses => "cacheMisses",
            ResourceMetric::PageCacheHits => "pageCacheHits",
            ResourceMetric::SoftIrq => "softIrqCount",
            ResourceMetric::GpuSmUtil => "smUtil",
            ResourceMetric::GpuMemUtil => "memUtil",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "cpuRunTimeMs" => ResourceMetric::CpuRunTimeMs,
            "taskClockMs" => ResourceMetric::TaskClockMs,
            "cpuCycles" => ResourceMetric::CpuCycles,
            "cpuInstructions" => ResourceMetric::CpuInstructions,
            "cacheMisses" => ResourceMetric::CacheMisses,
            "pageCacheHits" => ResourceMetric::PageCacheHits,
            "softIrqCount" => ResourceMetric::SoftIrq,
            "smUtil" => ResourceMetric::GpuSmUtil,
            "memUtil" => ResourceMetric::GpuMemUtil,
            _ => return None,
        })
    }

    /// Whether the signal comes from hardware PMU counters (may be absent on
    /// a given host or kernel).
    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            ResourceMetric::CpuCycles
                | ResourceMetric::CpuInstructions
                | ResourceMetric::CacheMisses
        )
    }

    /// Series name fragment on the scrape surface: `<measure>_<unit>`.
    pub fn export_name(self) -> &'static str {
        match self {
            ResourceMetric::CpuRunTimeMs => "cpu_time_milliseconds",
            ResourceMetric::TaskClockMs => "task_clock_milliseconds",
            ResourceMetric::CpuCycles => "cpu_cycles",
            ResourceMetric::CpuInstructions => "cpu_instructions",
            ResourceMetric::CacheMisses => "cache_misses",
            ResourceMetric::PageCacheHits => "page_cache_hits",
            ResourceMetric::SoftIrq => "soft_irq_events",
            ResourceMetric::GpuSmUtil => "gpu_sm_utilization",
            ResourceMetric::GpuMemUtil => "gpu_memory_utilization",
        }
    }
}

impl fmt::Display for ResourceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preference order for the attribution ratio signal when the configured
/// metric has no node-level usage this tick.
pub const RATIO_FALLBACK_CHAIN: [ResourceMetric; 4] = [
    ResourceMetric::CpuInstructions,
    ResourceMetric::CpuCycles,
    ResourceMetric::CpuRunTimeMs,
    ResourceMetric::TaskClockMs,
];

/// Soft IRQ vector names, indexed by the kernel's softirq number.
pub const SOFT_IRQ_NAMES: [&str; 10] = [
    "HI", "TIMER", "NET_TX", "NET_RX", "BLOCK", "IRQ_POLL", "TASKLET", "SCHED", "HRTIMER", "RCU",
];

/// An energy component of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Pkg,
    Core,
    Uncore,
    Dram,
    Gpu,
    Platform,
    Other,
}

impl Component {
    pub const ALL: [Component; 7] = [
        Component::Pkg,
        Component::Core,
        Component::Uncore,
        Component::Dram,
        Component::Gpu,
        Component::Platform,
        Component::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Pkg => "package",
            Component::Core => "core",
            Component::Uncore => "uncore",
            Component::Dram => "dram",
            Component::Gpu => "gpu",
            Component::Platform => "platform",
            Component::Other => "other",
        }
    }

    /// Default ratio signal used to split this component's dynamic energy.
    pub fn default_ratio_metric(self) -> ResourceMetric {
        match self {
            Component::Pkg | Component::Core | Component::Uncore => ResourceMetric::CpuInstructions,
            Component::Dram => ResourceMetric::TaskClockMs,
            Component::Gpu => ResourceMetric::GpuSmUtil,
            Component::Platform | Component::Other => ResourceMetric::CpuRunTimeMs,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an energy figure is baseline or workload-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mode {
    Dynamic,
    Idle,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Dynamic, Mode::Idle];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Dynamic => "dynamic",
            Mode::Idle => "idle",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of resource metrics active for this run.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    metrics: Vec<ResourceMetric>,
}

impl MetricRegistry {
    /// Build the registry from the probe's supported metrics plus feature
    /// toggles. GPU metrics enter the registry only when the accelerator
    /// source is enabled; soft IRQ counts only when IRQ accounting is.
    pub fn new(supported: &[ResourceMetric], enable_gpu: bool, enable_irq: bool) -> Self {
        let mut metrics: Vec<ResourceMetric> = supported
            .iter()
            .copied()
            .filter(|m| match m {
                ResourceMetric::SoftIrq => enable_irq,
                ResourceMetric::GpuSmUtil | ResourceMetric::GpuMemUtil => enable_gpu,
                _ => true,
            })
            .collect();
        if enable_gpu {
            for gpu_metric in [ResourceMetric::GpuSmUtil, ResourceMetric::GpuMemUtil] {
                if !metrics.contains(&gpu_metric) {
                    metrics.push(gpu_metric);
                }
            }
        }
        metrics.sort_unstable();
        metrics.dedup();
        Self { metrics }
    }

    pub fn contains(&self, metric: ResourceMetric) -> bool {
        self.metrics.contains(&metric)
    }

    pub fn metrics(&self) -> &[ResourceMetric] {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_canonical_names() {
        for m in [
            ResourceMetric::CpuRunTimeMs,
            ResourceMetric::TaskClockMs,
            ResourceMetric::CpuCycles,
            ResourceMetric::CpuInstructions,
            ResourceMetric::CacheMisses,
            ResourceMetric::PageCacheHits,
            ResourceMetric::SoftIrq,
            ResourceMetric::GpuSmUtil,
            ResourceMetric::GpuMemUtil,
        ] {
            assert_eq!(ResourceMetric::parse(m.as_str()), Some(m));
        }
        assert_eq!(ResourceMetric::parse("bogus"), None);
    }

    #[test]
    fn registry_filters_by_toggles() {
        let supported = [
            ResourceMetric::CpuRunTimeMs,
            ResourceMetric::CpuInstructions,
            ResourceMetric::SoftIrq,
        ];
        let reg = MetricRegistry::new(&supported, false, false);
        assert!(reg.contains(ResourceMetric::CpuRunTimeMs));
        assert!(reg.contains(ResourceMetric::CpuInstructions));
        assert!(!reg.contains(ResourceMetric::SoftIrq));
        assert!(!reg.contains(ResourceMetric::GpuSmUtil));

        let reg = MetricRegistry::new(&supported, true, true);
        assert!(reg.contains(ResourceMetric::SoftIrq));
        assert!(reg.contains(ResourceMetric::GpuSmUtil));
        assert!(reg.contains(ResourceMetric::GpuMemUtil));
    }

    #[test]
    fn default_ratio_metrics_per_component() {
        assert_eq!(
            Component::Pkg.default_ratio_metric(),
            ResourceMetric::CpuInstructions
        );
        assert_eq!(
            Component::Dram.default_ratio_metric(),
            ResourceMetric::TaskClockMs
        );
        assert_eq!(
            Component::Gpu.default_ratio_metric(),
            ResourceMetric::GpuSmUtil
        );
        assert_eq!(
            Component::Platform.default_ratio_metric(),
            ResourceMetric::CpuRunTimeMs
        );
    }
}
