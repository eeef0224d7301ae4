use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::error::SinkError;
use crate::window::GroupedBatch;

/// Collector endpoint and tags shared by every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTarget {
    pub host: String,
    pub port: u16,
    pub store_name: String,
    pub namespace: String,
}

impl Display for SinkTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Writes the summary of one closed batch to an external collector.
///
/// Implementations own their timeout: a write must return, with an error if
/// need be, rather than wait on an unavailable collector.
#[async_trait]
pub trait MetricsSinkWriter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, target: &SinkTarget, batch: &GroupedBatch) -> Result<(), SinkError>;
}

/// The two writers fed by the windowed branch.
#[derive(Clone)]
pub struct SinkWriters {
    pub rows: Arc<dyn MetricsSinkWriter>,
    pub feature_values: Arc<dyn MetricsSinkWriter>,
}

impl SinkWriters {
    pub fn new(
        rows: Arc<dyn MetricsSinkWriter>,
        feature_values: Arc<dyn MetricsSinkWriter>,
    ) -> Self {
        Self {
            rows,
            feature_values,
        }
    }

    pub(crate) fn into_vec(self) -> Vec<Arc<dyn MetricsSinkWriter>> {
        vec![self.rows, self.feature_values]
    }
}
