//! Monotonic counter primitives.
//!
//! Every measured quantity in the store is a [`Counter`] with three
//! observable fields: `delta` (added during the current tick), `total`
//! (cumulative over the agent lifetime) and `prev_delta` (the last non-zero
//! delta, used to impute a value when an aggregate source rolls over).
//!
//! Counters are fed one of two ways: additively via [`Counter::add_delta`]
//! (probe and utilization signals, attribution output), or from a cumulative
//! upstream reading via [`Counter::set_aggregate`] (hardware energy
//! counters). Rollover and overflow are reported as signals, never panics.

use std::collections::BTreeMap;

use thiserror::Error;

/// Non-fatal conditions a counter update can report.
///
/// Callers log these and continue; the counter is left in a usable state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CounterError {
    /// `total` would have exceeded the u64 range; it was clamped to the
    /// current `delta` so the counter keeps evolving monotonically from
    /// there.
    #[error("counter total overflowed, clamped to current delta")]
    Overflow,
    /// An aggregate source reported a smaller cumulative value than before.
    /// The delta for this tick was imputed from `prev_delta`.
    #[error("aggregate counter decreased, delta imputed from previous")]
    Rollover,
}

/// A monotonic counter with per-tick delta tracking.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    delta: u64,
    total: u64,
    prev_delta: u64,
    /// Whether an aggregate reading has been observed yet. The first
    /// `set_aggregate` records the baseline only and leaves `delta` at zero.
    primed: bool,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value added during the current tick.
    pub fn delta(&self) -> u64 {
        self.delta
    }

    /// Cumulative value over the agent lifetime.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The last non-zero delta observed before the current tick.
    pub fn prev_delta(&self) -> u64 {
        self.prev_delta
    }

    /// Add `v` to both `delta` and `total`.
    ///
    /// Additive across the tick: multiple sources may contribute to the same
    /// counter before the tick ends. On u64 overflow of `total` the total is
    /// clamped to the current delta and [`CounterError::Overflow`] is
    /// returned.
    pub fn add_delta(&mut self, v: u64) -> Result<(), CounterError> {
        self.delta = self.delta.saturating_add(v);
        match self.total.checked_add(v) {
            Some(total) => {
                self.total = total;
                Ok(())
            }
            None => {
                self.total = self.delta;
                Err(CounterError::Overflow)
            }
        }
    }

    /// Feed a cumulative reading from an upstream source.
    ///
    /// The first observation records the baseline `total` and leaves `delta`
    /// untouched. Afterwards a non-decreasing reading contributes
    /// `new_total - total` to the delta; a decrease is treated as a source
    /// rollover: the tick's delta is imputed from `prev_delta`, `total`
    /// restarts at the new reading and [`CounterError::Rollover`] is
    /// returned.
    pub fn set_aggregate(&mut self, new_total: u64) -> Result<(), CounterError> {
        if !self.primed {
            self.primed = true;
            self.total = new_total;
            return Ok(());
        }
        if new_total >= self.total {
            self.delta = self.delta.saturating_add(new_total - self.total);
            self.total = new_total;
            Ok(())
        } else {
            self.delta = self.delta.saturating_add(self.prev_delta);
            self.total = new_total;
            Err(CounterError::Rollover)
        }
    }

    /// Clear `delta` for a new tick, preserving `total`.
    ///
    /// The outgoing delta is copied into `prev_delta` only when non-zero, so
    /// rollover imputation reaches past quiet ticks.
    pub fn reset_delta(&mut self) {
        if self.delta != 0 {
            self.prev_delta = self.delta;
        }
        self.delta = 0;
    }
}

/// A group of named counters sharing the same semantics (per-socket,
/// per-cpu, per-device, per-sensor).
///
/// Members are kept sorted by name so iteration order, and therefore scrape
/// output, is deterministic.
#[derive(Debug, Default, Clone)]
pub struct CounterCollection {
    members: BTreeMap<String, Counter>,
}

impl CounterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Fetch a member counter, creating it on first use.
    pub fn member_mut(&mut self, name: &str) -> &mut Counter {
        if !self.members.contains_key(name) {
            self.members.insert(name.to_string(), Counter::new());
        }
        self.members.get_mut(name).expect("member just inserted")
    }

    pub fn member(&self, name: &str) -> Option<&Counter> {
        self.members.get(name)
    }

    pub fn add_delta(&mut self, name: &str, v: u64) -> Result<(), CounterError> {
        self.member_mut(name).add_delta(v)
    }

    pub fn set_aggregate(&mut self, name: &str, v: u64) -> Result<(), CounterError> {
        self.member_mut(name).set_aggregate(v)
    }

    /// Sum of member deltas.
    pub fn delta(&self) -> u64 {
        self.members.values().map(Counter::delta).sum()
    }

    /// Sum of member totals.
    pub fn total(&self) -> u64 {
        self.members.values().map(Counter::total).sum()
    }

    pub fn reset_delta(&mut self) {
        for counter in self.members.values_mut() {
            counter.reset_delta();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Counter)> {
        self.members.iter().map(|(name, c)| (name.as_str(), c))
    }
}
