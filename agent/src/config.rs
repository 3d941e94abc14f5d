//! Agent configuration.
//!
//! Options load from a YAML file and may be overridden by CLI flags.
//! Unrecognized options are rejected at startup: the config struct denies
//! unknown fields, so a typo fails fast instead of silently doing nothing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::metrics::{Component, ResourceMetric};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct Config {
    /// Tick cadence in seconds.
    pub sample_interval_seconds: u64,
    /// Resolve entities via the kernel cgroup id instead of
    /// `/proc/<pid>/cgroup`.
    pub use_cgroup_id: bool,
    /// Merge non-container pids into a single system entity.
    pub merge_system: bool,
    /// Distribute node idle energy across containers.
    pub enable_idle_attribution: bool,
    #[serde(rename = "enableGPU")]
    pub enable_gpu: bool,
    #[serde(rename = "enableQAT")]
    pub enable_qat: bool,
    #[serde(rename = "enableIRQ")]
    pub enable_irq: bool,
    pub enable_cgroup_metrics: bool,
    pub enable_kubelet_metrics: bool,
    pub enable_process_metrics: bool,
    #[serde(rename = "enableVMMetrics")]
    pub enable_vm_metrics: bool,
    /// Component name -> resource metric used as the attribution ratio
    /// signal, overriding the per-component defaults.
    pub ratio_metric_per_component: BTreeMap<String, String>,
    pub redfish_cred_file_path: Option<PathBuf>,
    pub hmc_endpoint: Option<String>,
    pub access_token: Option<String>,
    /// Forces the CPU architecture label; otherwise detected from
    /// /proc/cpuinfo and the model lookup file.
    pub cpu_arch_override: Option<String>,
    /// Ticks a process may sit idle before becoming a GC candidate.
    pub proc_idle_ticks: u32,
    /// Ticks a container/VM may run process-less before GC.
    pub grace_ticks: u32,
    /// Idle decomposition warm-up window.
    pub idle_window_ticks: u32,
    /// Consecutive failures before a source is disabled.
    pub max_source_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_interval_seconds: 3,
            use_cgroup_id: false,
            merge_system: false,
            enable_idle_attribution: false,
            enable_gpu: false,
            enable_qat: false,
            enable_irq: false,
            enable_cgroup_metrics: false,
            enable_kubelet_metrics: false,
            enable_process_metrics: true,
            enable_vm_metrics: true,
            ratio_metric_per_component: BTreeMap::new(),
            redfish_cred_file_path: None,
            hmc_endpoint: None,
            access_token: None,
            cpu_arch_override: None,
            proc_idle_ticks: 20,
            grace_ticks: 10,
            idle_window_ticks: 60,
            max_source_failures: 5,
        }
    }
}

impl Config {
    /// Load from a YAML file; a missing `path` of `None` yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sample_interval_seconds == 0 {
            bail!("sampleIntervalSeconds must be at least 1");
        }
        if self.idle_window_ticks == 0 {
            bail!("idleWindowTicks must be at least 1");
        }
        self.ratio_metrics()?;
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }

    /// Parse the ratio-metric overrides into typed form.
    pub fn ratio_metrics(&self) -> anyhow::Result<BTreeMap<Component, ResourceMetric>> {
        let mut out = BTreeMap::new();
        for (component_name, metric_name) in &self.ratio_metric_per_component {
            let component = parse_component(component_name).with_context(|| {
                format!("ratioMetricPerComponent: unknown component {component_name:?}")
            })?;
            let metric = ResourceMetric::parse(metric_name).with_context(|| {
                format!("ratioMetricPerComponent: unknown metric {metric_name:?}")
            })?;
            out.insert(component, metric);
        }
        Ok(out)
    }
}

fn parse_component(name: &str) -> Option<Component> {
    Some(match name {
        "pkg" | "package" => Component::Pkg,
        "core" => Component::Core,
        "uncore" => Component::Uncore,
        "dram" => Component::Dram,
        "gpu" => Component::Gpu,
        "platform" => Component::Platform,
        "other" => Component::Other,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.sample_interval_seconds, 3);
        assert!(!config.use_cgroup_id);
        assert!(!config.enable_idle_attribution);
        assert_eq!(config.grace_ticks, 10);
        assert_eq!(config.idle_window_ticks, 60);
    }

    #[test]
    fn loads_recognized_options() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(
            &path,
            "sampleIntervalSeconds: 5\nuseCgroupId: true\nenableGPU: true\nenableIRQ: true\nratioMetricPerComponent:\n  dram: cpuCycles\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.sample_interval_seconds, 5);
        assert!(config.use_cgroup_id);
        assert!(config.enable_gpu);
        let ratios = config.ratio_metrics().unwrap();
        assert_eq!(ratios[&Component::Dram], ResourceMetric::CpuCycles);
    }

    #[test]
    fn rejects_unrecognized_options() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(&path, "sampleIntervalSeconds: 5\nnotARealOption: true\n").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("invalid config file"));
    }

    #[test]
    fn rejects_unknown_ratio_metric() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(
            &path,
            "ratioMetricPerComponent:\n  package: bogusMetric\n",
        )
        .unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(&path, "sampleIntervalSeconds: 0\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
