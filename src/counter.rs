//! Process-lifetime monotonic counters for failure-style collectors.
//!
//! Counter state lives outside the cache. Entries expire and get rebuilt;
//! accumulated values only ever grow.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::error::CounterError;
use crate::exposition::{MetricFamily, MetricKind};

/// Identity of one counter: family plus label values in declared order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
struct CounterKey {
    family: String,
    labels: Vec<String>,
}

/// Point-in-time value of one counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterState {
    pub family: String,
    pub labels: Vec<String>,
    pub value: f64,
}

/// Thread-safe map of monotonic counters.
#[derive(Debug, Default)]
pub struct CounterAccumulator {
    state: Mutex<BTreeMap<CounterKey, f64>>,
}

impl CounterAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the counter for `(family, labels)`, creating it at zero
    /// first if needed. Returns the new cumulative value.
    pub fn increment(&self, family: &str, labels: &[String], delta: f64) -> Result<f64, CounterError> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(CounterError::InvalidDelta {
                family: family.to_string(),
                delta,
            });
        }

        let key = CounterKey {
            family: family.to_string(),
            labels: labels.to_vec(),
        };
        let mut state = self.state.lock();
        let value = state.entry(key).or_insert(0.0);
        *value += delta;

        trace!(target: "exporter::counter", family, labels = ?labels, delta, value = *value, "Counter incremented");
        Ok(*value)
    }

    /// Current value of one counter, if it was ever observed.
    pub fn value(&self, family: &str, labels: &[String]) -> Option<f64> {
        let key = CounterKey {
            family: family.to_string(),
            labels: labels.to_vec(),
        };
        self.state.lock().get(&key).copied()
    }

    /// Copy of every counter, ordered by family then label values.
    pub fn snapshot(&self) -> Vec<CounterState> {
        let state = self.state.lock();
        state
            .iter()
            .map(|(key, value)| CounterState {
                family: key.family.clone(),
                labels: key.labels.clone(),
                value: *value,
            })
            .collect()
    }

    /// Snapshot of one family as a renderable counter family.
    pub fn family(&self, name: &str, help: &str, label_names: &[&str]) -> MetricFamily {
        let mut family = MetricFamily::new(name, help, MetricKind::Counter, label_names);
        for counter in self.snapshot().into_iter().filter(|c| c.family == name) {
            family.push(counter.labels, counter.value);
        }
        family
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }
}
