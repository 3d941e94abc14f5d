//! Probe exporter contract.
//!
//! The in-kernel probe machinery (bytecode loading, perf-event fd plumbing,
//! map iteration) lives outside this crate. The collector consumes the
//! [`ProbeExporter`] trait: one batch of per-PID counter records plus the
//! set of PIDs the kernel freed since the last tick.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::SourceError;
use crate::metrics::ResourceMetric;

/// Number of soft IRQ vectors tracked per process.
pub const SOFT_IRQ_VECTORS: usize = 10;

/// One per-PID record drained from the kernel probes.
///
/// Hardware counter fields are zero when the PMU is unavailable; the
/// collector must tolerate duplicated pids within a batch and arbitrary key
/// churn between ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Thread id; equals `pid` for the group leader.
    pub tid: u32,
    pub cgroup_id: u64,
    pub cpu_run_time_ms: u64,
    pub task_clock_ms: u64,
    pub cpu_cycles: u64,
    pub cpu_instructions: u64,
    pub cache_misses: u64,
    pub page_cache_hits: u64,
    pub soft_irq_counts: [u64; SOFT_IRQ_VECTORS],
    /// Kernel task comm, NUL-padded.
    pub comm: [u8; 16],
}

impl ProcessRecord {
    /// Decode the NUL-terminated comm bytes. Empty when the kernel did not
    /// fill the field.
    pub fn command(&self) -> String {
        let nul = self.comm.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.comm[..nul]).to_string()
    }

    /// Convenience for building records with a readable command name.
    pub fn with_command(mut self, command: &str) -> Self {
        let bytes = command.as_bytes();
        let n = bytes.len().min(15);
        self.comm = [0; 16];
        self.comm[..n].copy_from_slice(&bytes[..n]);
        self
    }
}

/// One tick's drain of the probe state.
#[derive(Debug, Clone, Default)]
pub struct ProbeBatch {
    pub records: Vec<ProcessRecord>,
    /// PIDs the kernel reported as exited since the previous drain.
    pub freed_pids: Vec<u32>,
}

/// Metric names the probe can populate, split by counter class.
#[derive(Debug, Clone, Default)]
pub struct SupportedMetrics {
    pub hardware: Vec<ResourceMetric>,
    pub software: Vec<ResourceMetric>,
}

impl SupportedMetrics {
    pub fn all(&self) -> Vec<ResourceMetric> {
        let mut out = self.software.clone();
        out.extend(self.hardware.iter().copied());
        out
    }
}

/// Capability interface over the kernel probe machinery.
pub trait ProbeExporter: Send {
    /// Attach probes. Called once before the first tick.
    fn start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Drain per-PID counters accumulated since the previous call.
    fn collect(&mut self) -> Result<ProbeBatch, SourceError>;

    /// Detach probes. Called once after the tick loop exits.
    fn stop(&mut self) {}

    /// Which metrics this exporter populates, used to build the registry.
    fn supported_metrics(&self) -> SupportedMetrics;
}

/// Probe exporter for hosts without probe support: empty batches, no
/// metrics. The collector's algorithm is identical regardless.
#[derive(Debug, Default)]
pub struct DisabledProbe;

impl ProbeExporter for DisabledProbe {
    fn collect(&mut self) -> Result<ProbeBatch, SourceError> {
        Ok(ProbeBatch::default())
    }

    fn supported_metrics(&self) -> SupportedMetrics {
        SupportedMetrics::default()
    }
}

/// Replays a canned sequence of batches, one per `collect` call. Used as a
/// test double and for offline replay of recorded workloads. Once the
/// sequence is exhausted, empty batches follow.
#[derive(Debug, Default)]
pub struct ReplayProbe {
    batches: Mutex<VecDeque<ProbeBatch>>,
    supported: SupportedMetrics,
}

impl ReplayProbe {
    pub fn new(batches: Vec<ProbeBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            supported: SupportedMetrics {
                hardware: vec![
                    ResourceMetric::CpuCycles,
                    ResourceMetric::CpuInstructions,
                    ResourceMetric::CacheMisses,
                ],
                software: vec![
                    ResourceMetric::CpuRunTimeMs,
                    ResourceMetric::TaskClockMs,
                    ResourceMetric::PageCacheHits,
                    ResourceMetric::SoftIrq,
                ],
            },
        }
    }

    pub fn with_supported(mut self, supported: SupportedMetrics) -> Self {
        self.supported = supported;
        self
    }

    /// Append a batch to the replay queue.
    pub fn push(&self, batch: ProbeBatch) {
        self.batches.lock().expect("replay queue poisoned").push_back(batch);
    }
}

impl ProbeExporter for ReplayProbe {
    fn collect(&mut self) -> Result<ProbeBatch, SourceError> {
        let mut queue = self.batches.lock().expect("replay queue poisoned");
        Ok(queue.pop_front().unwrap_or_default())
    }

    fn supported_metrics(&self) -> SupportedMetrics {
        self.supported.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_decodes_nul_terminated_comm() {
        let rec = ProcessRecord::default().with_command("nginx");
        assert_eq!(rec.command(), "nginx");

        let rec = ProcessRecord::default().with_command("a-very-long-command-name");
        assert_eq!(rec.command().len(), 15);
    }

    #[test]
    fn replay_probe_drains_in_order_then_empties() {
        let batch = ProbeBatch {
            records: vec![ProcessRecord {
                pid: 42,
                tid: 42,
                ..Default::default()
            }],
            freed_pids: vec![7],
        };
        let mut probe = ReplayProbe::new(vec![batch]);
        let first = probe.collect().unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.freed_pids, vec![7]);
        let second = probe.collect().unwrap();
        assert!(second.records.is_empty());
        assert!(second.freed_pids.is_empty());
    }
}
