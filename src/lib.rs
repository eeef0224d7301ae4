//! Inflight metrics stage for a feature ingestion write path.
//!
//! Every feature row passing through the stage is counted on
//! `Inflight.elements_count`. When the `statsd` exporter is configured, rows
//! are additionally grouped into tumbling windows per feature set, and each
//! closed group is summarised to a statsd collector by two independent
//! writers: one for row counts and ingestion lag, one for feature value
//! distributions. With any other exporter type rows are dropped after
//! counting.
//!
//! # Example
//!
//! ```rust,no_run
//! use inflight_metrics::{FeatureRow, InflightMetrics, InflightSettings, MetricsRegistry};
//! use futures::stream::{self, StreamExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = InflightSettings::new()?;
//!     let registry = MetricsRegistry::new();
//!     let stage = InflightMetrics::new(&settings, &registry)?;
//!
//!     let rows = vec![
//!         FeatureRow::new("project/driver_stats", chrono::Utc::now()),
//!         FeatureRow::new("project/customer_stats", chrono::Utc::now()),
//!     ];
//!     stage.process_stream(stream::iter(rows).boxed()).await;
//!     stage.finish().await;
//!
//!     for (name, value) in registry.snapshot() {
//!         println!("{name} = {value}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod counter;
pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod record;
pub mod registry;
pub mod shutdown;
pub mod sink;
pub mod stage;
pub mod statsd;
pub mod strategy;
pub mod window;

#[cfg(test)]
mod tests;

pub use crate::config::{InflightSettings, MetricsSettings, Overrides, PipelineSettings, WindowTimestamp};
pub use counter::{RecordCounter, ELEMENTS_COUNT};
pub use dispatcher::MetricDispatcher;
pub use emitter::{Clock, SystemClock};
pub use error::{InflightError, InflightResult, SinkError};
pub use record::{FeatureRow, Field, FieldValue};
pub use registry::{Counter, MetricName, MetricsRegistry};
pub use sink::{MetricsSinkWriter, SinkTarget, SinkWriters};
pub use stage::{InflightMetrics, NoopDrain, LATE_ELEMENTS_DROPPED, SINK_WRITE_FAILURES};
pub use statsd::{StatsdClient, StatsdFeatureValueMetricsWriter, StatsdRowMetricsWriter};
pub use strategy::ExporterStrategy;
pub use window::{GroupedBatch, Window, WindowedGrouper};
