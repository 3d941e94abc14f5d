//! Counter primitives and the resource-metric registry.

mod counter;
mod registry;

pub use counter::{Counter, CounterCollection, CounterError};
pub use registry::{
    Component, MetricRegistry, Mode, ResourceMetric, RATIO_FALLBACK_CHAIN, SOFT_IRQ_NAMES,
};
