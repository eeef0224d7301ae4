//! Process-wide counters owned through an explicit registry handle.
//!
//! The registry is cheap to clone; clones share the same counters. Components
//! receive the handle at construction instead of reaching for global state.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName {
    pub namespace: String,
    pub name: String,
}

impl Display for MetricName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Monotonic counter. Increments are relaxed atomic adds and never block.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<BTreeMap<MetricName, Counter>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter registered under `namespace.name`, creating it on
    /// first use. Callers should keep the returned handle rather than look it
    /// up per increment.
    pub fn counter(&self, namespace: &str, name: &str) -> Counter {
        let key = MetricName {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };

        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return counter.clone();
        }

        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<u64> {
        let key = MetricName {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(Counter::get)
    }

    /// Current value of every counter, ordered by name.
    pub fn snapshot(&self) -> Vec<(MetricName, u64)> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, counter)| (name.clone(), counter.get()))
            .collect()
    }
}
