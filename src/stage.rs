use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tracing::info;

use crate::config::InflightSettings;
use crate::counter::RecordCounter;
use crate::emitter::{Clock, EmitterCounters, SystemClock, WindowedEmitter};
use crate::error::InflightResult;
use crate::record::FeatureRow;
use crate::registry::MetricsRegistry;
use crate::shutdown::{shutdown_channel, ShutdownSender};
use crate::sink::{SinkTarget, SinkWriters};
use crate::statsd::{StatsdClient, StatsdFeatureValueMetricsWriter, StatsdRowMetricsWriter};
use crate::strategy::ExporterStrategy;

pub const LATE_ELEMENTS_DROPPED: &str = "late_elements_dropped";
pub const SINK_WRITE_FAILURES: &str = "sink_write_failures";

/// Discards rows once they have been counted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDrain;

impl NoopDrain {
    #[inline]
    pub fn drain(&self, _row: FeatureRow) {}
}

enum Branch {
    Windowed(WindowedEmitter),
    Noop(NoopDrain),
}

/// The inflight metrics stage.
///
/// Every observed row is counted on `<namespace>.elements_count`. With the
/// `statsd` exporter, rows are also grouped per tumbling window and feature
/// set, and each closed group is summarised to the collector by the row and
/// feature value writers. Otherwise rows are dropped after counting.
///
/// Must be created inside a tokio runtime when the windowed branch is
/// selected, since the close trigger and writers run as tasks.
pub struct InflightMetrics {
    counter: RecordCounter,
    branch: Branch,
    parallelism: usize,
    shutdown: ShutdownSender,
}

impl InflightMetrics {
    /// Builds the stage with the statsd writers and the system clock.
    pub fn new(settings: &InflightSettings, registry: &MetricsRegistry) -> InflightResult<Self> {
        let client = StatsdClient::new(settings.metrics.sink_timeout());
        let writers = SinkWriters::new(
            Arc::new(StatsdRowMetricsWriter::new(client.clone())),
            Arc::new(StatsdFeatureValueMetricsWriter::new(client)),
        );
        Self::with_writers(settings, registry, writers, Arc::new(SystemClock))
    }

    pub fn with_writers(
        settings: &InflightSettings,
        registry: &MetricsRegistry,
        writers: SinkWriters,
        clock: Arc<dyn Clock>,
    ) -> InflightResult<Self> {
        settings.validate()?;
        let metrics = &settings.metrics;
        let namespace = metrics.namespace.as_str();
        let shutdown = shutdown_channel();

        let branch = match ExporterStrategy::select(metrics)? {
            ExporterStrategy::Windowed(export) => {
                info!(
                    host = %export.host,
                    port = export.port,
                    window_secs = export.window_size.as_secs(),
                    store = %metrics.store_name,
                    "inflight metrics export enabled"
                );
                let target = SinkTarget {
                    host: export.host.clone(),
                    port: export.port,
                    store_name: metrics.store_name.clone(),
                    namespace: namespace.to_string(),
                };
                let counters = EmitterCounters {
                    late: registry.counter(namespace, LATE_ELEMENTS_DROPPED),
                    sink_failures: registry.counter(namespace, SINK_WRITE_FAILURES),
                };
                Branch::Windowed(WindowedEmitter::spawn(
                    &export,
                    target,
                    writers,
                    metrics.channel_capacity,
                    clock,
                    counters,
                    &shutdown,
                ))
            }
            ExporterStrategy::None => {
                info!("inflight metrics export disabled, counting only");
                Branch::Noop(NoopDrain)
            }
        };

        Ok(Self {
            counter: RecordCounter::new(registry, namespace),
            branch,
            parallelism: settings.pipeline.parallelism,
            shutdown,
        })
    }

    pub fn is_windowed(&self) -> bool {
        matches!(self.branch, Branch::Windowed(_))
    }

    /// Rows counted so far by this stage's counter.
    pub fn count(&self) -> u64 {
        self.counter.count()
    }

    /// Groups accumulating in open windows. Always zero on the no-op branch.
    pub fn open_groups(&self) -> usize {
        match &self.branch {
            Branch::Windowed(emitter) => emitter.open_groups(),
            Branch::Noop(_) => 0,
        }
    }

    pub fn observe(&self, row: FeatureRow) {
        let row = self.counter.observe(row);
        match &self.branch {
            Branch::Windowed(emitter) => {
                emitter.add(row);
            }
            Branch::Noop(drain) => drain.drain(row),
        }
    }

    /// Observes every row of `rows`, up to `parallelism` at a time.
    pub async fn process_stream(&self, rows: BoxStream<'_, FeatureRow>) {
        rows.for_each_concurrent(self.parallelism, |row| async move {
            self.observe(row);
        })
        .await;
    }

    /// Closes the windows that are due now instead of waiting for the next
    /// tick. Returns the number of batches handed to the writers.
    pub async fn close_due_windows(&self) -> usize {
        match &self.branch {
            Branch::Windowed(emitter) => emitter.close_due_windows().await,
            Branch::Noop(_) => 0,
        }
    }

    /// Input is exhausted: every open window is closed and delivered.
    pub async fn finish(self) {
        if let Branch::Windowed(emitter) = self.branch {
            emitter.finish().await;
        }
        info!(elements = self.counter.count(), "inflight metrics stage finished");
    }

    /// Stops the stage. Open windows and pending writes are discarded.
    pub async fn cancel(self) {
        let _ = self.shutdown.send(());
        if let Branch::Windowed(emitter) = self.branch {
            emitter.cancel().await;
        }
        info!(elements = self.counter.count(), "inflight metrics stage cancelled");
    }
}
