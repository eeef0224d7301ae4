use crate::record::FeatureRow;
use crate::registry::{Counter, MetricsRegistry};

pub const ELEMENTS_COUNT: &str = "elements_count";

/// Counts every row passing through the stage, on both branches.
#[derive(Debug, Clone)]
pub struct RecordCounter {
    elements: Counter,
}

impl RecordCounter {
    pub fn new(registry: &MetricsRegistry, namespace: &str) -> Self {
        Self {
            elements: registry.counter(namespace, ELEMENTS_COUNT),
        }
    }

    /// Increments the counter and hands the row back untouched.
    pub fn observe(&self, row: FeatureRow) -> FeatureRow {
        self.elements.inc();
        row
    }

    pub fn count(&self) -> u64 {
        self.elements.get()
    }
}
