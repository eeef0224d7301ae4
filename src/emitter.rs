use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::WindowTimestamp;
use crate::dispatcher::{BatchPublisher, MetricDispatcher};
use crate::record::FeatureRow;
use crate::registry::Counter;
use crate::shutdown::{ShutdownReceiver, ShutdownSender};
use crate::sink::{SinkTarget, SinkWriters};
use crate::strategy::WindowedExport;
use crate::window::{Assignment, GroupedBatch, WindowedGrouper};

/// Wall clock used for ingestion timestamps and watermarks.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Counters touched by the windowed branch.
#[derive(Debug, Clone, Default)]
pub struct EmitterCounters {
    pub late: Counter,
    pub sink_failures: Counter,
}

/// Windowed branch: grouping, the time-driven close trigger and the
/// dispatcher.
pub struct WindowedEmitter {
    trigger: Arc<CloseTrigger>,
    dispatcher: MetricDispatcher,
    closer: JoinHandle<()>,
    stop: oneshot::Sender<()>,
    timestamp: WindowTimestamp,
}

struct CloseTrigger {
    grouper: WindowedGrouper,
    publisher: BatchPublisher,
    clock: Arc<dyn Clock>,
    allowed_lateness: Duration,
}

impl CloseTrigger {
    fn watermark(&self) -> i64 {
        let lateness = i64::try_from(self.allowed_lateness.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_sub(lateness)
    }

    /// Closes due windows and hands them to the writers. The closer only
    /// checks for stop between ticks, so drained batches are always published.
    async fn tick(&self) -> usize {
        self.publish(self.grouper.close_until(self.watermark())).await
    }

    async fn publish(&self, batches: Vec<GroupedBatch>) -> usize {
        let closed = batches.len();
        for batch in batches {
            debug!(
                key = %batch.key,
                window_start = batch.window.start_ms,
                rows = batch.rows.len(),
                "window closed"
            );
            self.publisher.publish(batch).await;
        }
        closed
    }
}

impl WindowedEmitter {
    pub fn spawn(
        export: &WindowedExport,
        target: SinkTarget,
        writers: SinkWriters,
        channel_capacity: usize,
        clock: Arc<dyn Clock>,
        counters: EmitterCounters,
        shutdown: &ShutdownSender,
    ) -> Self {
        let dispatcher = MetricDispatcher::spawn(
            target,
            writers.into_vec(),
            channel_capacity,
            shutdown,
            counters.sink_failures,
        );
        let trigger = Arc::new(CloseTrigger {
            grouper: WindowedGrouper::new(export.window_size, counters.late),
            publisher: dispatcher.publisher(),
            clock,
            allowed_lateness: export.allowed_lateness,
        });
        let (stop, stopped) = oneshot::channel();
        let closer = tokio::spawn(run_closer(
            trigger.clone(),
            export.close_interval,
            stopped,
            shutdown.subscribe(),
        ));

        Self {
            trigger,
            dispatcher,
            closer,
            stop,
            timestamp: export.window_timestamp,
        }
    }

    pub fn add(&self, row: FeatureRow) -> Assignment {
        let clock = &self.trigger.clock;
        // read under the shard lock, so a monotonic clock never stamps a row
        // behind the watermark
        self.trigger.grouper.add_with(row, |row| match self.timestamp {
            WindowTimestamp::Ingestion => clock.now_millis(),
            WindowTimestamp::Event => row.event_timestamp.timestamp_millis(),
        })
    }

    /// Runs one close tick immediately. Returns the number of batches closed.
    pub async fn close_due_windows(&self) -> usize {
        self.trigger.tick().await
    }

    pub fn open_groups(&self) -> usize {
        self.trigger.grouper.open_groups()
    }

    /// End of input: closes every window and waits for both writers.
    pub async fn finish(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.closer.await {
            warn!(error = %e, "window close task failed");
        }
        let closed = self.trigger.publish(self.trigger.grouper.flush_all()).await;
        debug!(closed, "flushed open windows");
        // the trigger holds a publisher; writers only drain once it is gone
        drop(self.trigger);
        self.dispatcher.close().await;
    }

    /// Cancellation: open windows are dropped without a partial flush. The
    /// shutdown signal must already have been sent.
    pub async fn cancel(self) {
        drop(self.stop);
        if let Err(e) = self.closer.await {
            warn!(error = %e, "window close task failed");
        }
        let discarded = self.trigger.grouper.discard();
        if discarded > 0 {
            info!(discarded, "discarded rows of open windows on cancellation");
        }
        drop(self.trigger);
        self.dispatcher.close().await;
    }
}

async fn run_closer(
    trigger: Arc<CloseTrigger>,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
    mut shutdown: ShutdownReceiver,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                trigger.tick().await;
            }
        }
    }
}
