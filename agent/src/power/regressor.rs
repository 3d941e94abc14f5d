//! Pre-fitted linear regressors for component power estimation.
//!
//! Coefficients are trained offline, shipped as YAML keyed by CPU
//! microarchitecture, and consumed here: a per-entity feature vector (a
//! subset of the resource registry) produces a scalar estimate which the
//! attribution pass renormalizes so the entity sum equals the measured
//! node dynamic energy. No training happens in the agent.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::metrics::{Component, ResourceMetric};
use crate::store::ResourceCounters;

/// One component's linear model: `intercept + Σ weight_m * delta_m`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinearModel {
    #[serde(default)]
    pub intercept: f64,
    /// Weight per resource-metric name (registry names, e.g.
    /// `cpuInstructions`).
    pub weights: BTreeMap<String, f64>,
}

impl LinearModel {
    /// Estimate from an entity's current tick deltas. Never negative.
    pub fn predict(&self, resources: &ResourceCounters) -> f64 {
        let mut estimate = self.intercept;
        for (name, weight) in &self.weights {
            let Some(metric) = ResourceMetric::parse(name) else {
                continue;
            };
            estimate += weight * resources.delta(metric) as f64;
        }
        estimate.max(0.0)
    }
}

/// Coefficient sets for one microarchitecture.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UarchCoefficients {
    pub uarch: String,
    /// Component name (`package`, `core`, `dram`, ...) to model.
    pub components: BTreeMap<String, LinearModel>,
}

/// Models selected for the running host's microarchitecture.
#[derive(Debug, Clone, Default)]
pub struct Regressor {
    models: BTreeMap<Component, LinearModel>,
}

impl Regressor {
    /// Load coefficients and select the set matching `uarch`. Returns an
    /// empty regressor (ratio estimation everywhere) when the file is
    /// missing, the uarch is `unknown`, or no set matches.
    pub fn load(path: &Path, uarch: &str) -> Self {
        if uarch == super::cpuid::UNKNOWN_UARCH {
            return Self::default();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::info!(path = %path.display(), error = %e, "power model coefficients unavailable");
                return Self::default();
            }
        };
        let sets: Vec<UarchCoefficients> = match serde_yaml::from_str(&content) {
            Ok(sets) => sets,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed power model coefficients");
                return Self::default();
            }
        };
        Self::from_sets(sets, uarch)
    }

    pub fn from_sets(sets: Vec<UarchCoefficients>, uarch: &str) -> Self {
        let Some(set) = sets.into_iter().find(|s| s.uarch == uarch) else {
            return Self::default();
        };
        let mut models = BTreeMap::new();
        for (name, model) in set.components {
            let component = match name.as_str() {
                "package" => Component::Pkg,
                "core" => Component::Core,
                "uncore" => Component::Uncore,
                "dram" => Component::Dram,
                "gpu" => Component::Gpu,
                "platform" => Component::Platform,
                "other" => Component::Other,
                _ => {
                    tracing::warn!(component = %name, "unknown component in coefficients, skipped");
                    continue;
                }
            };
            models.insert(component, model);
        }
        Self { models }
    }

    pub fn model_for(&self, component: Component) -> Option<&LinearModel> {
        self.models.get(&component)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
