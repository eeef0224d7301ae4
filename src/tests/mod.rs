use crate::config::{InflightSettings, WindowTimestamp};
use crate::counter::ELEMENTS_COUNT;
use crate::emitter::Clock;
use crate::error::SinkError;
use crate::record::{FeatureRow, FieldValue};
use crate::registry::MetricsRegistry;
use crate::sink::{MetricsSinkWriter, SinkTarget, SinkWriters};
use crate::stage::{InflightMetrics, LATE_ELEMENTS_DROPPED, SINK_WRITE_FAILURES};
use crate::window::GroupedBatch;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use mockall::mock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mock! {
    pub SinkWriter {}
    #[async_trait]
    impl MetricsSinkWriter for SinkWriter {
        fn name(&self) -> &'static str;
        async fn write(&self, target: &SinkTarget, batch: &GroupedBatch) -> Result<(), SinkError>;
    }
}

struct ManualClock(AtomicI64);

impl ManualClock {
    fn at(ms: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(ms)))
    }

    fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingWriter {
    batches: Mutex<Vec<(SinkTarget, GroupedBatch)>>,
}

impl RecordingWriter {
    /// (window start, key, rows) of every batch received, sorted.
    fn received(&self) -> Vec<(i64, String, usize)> {
        let mut received: Vec<_> = self
            .batches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| (b.window.start_ms, b.key.clone(), b.rows.len()))
            .collect();
        received.sort();
        received
    }

    fn targets(&self) -> Vec<SinkTarget> {
        self.batches.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl MetricsSinkWriter for RecordingWriter {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn write(&self, target: &SinkTarget, batch: &GroupedBatch) -> Result<(), SinkError> {
        self.batches
            .lock()
            .unwrap()
            .push((target.clone(), batch.clone()));
        Ok(())
    }
}

fn settings(exporter: &str) -> InflightSettings {
    let mut settings = InflightSettings::default();
    settings.metrics.exporter_type = Some(exporter.to_string());
    settings.metrics.statsd_host = "collector".to_string();
    settings.metrics.statsd_port = 9125;
    settings.metrics.window_size_in_sec_for_feature_value_metric = 10;
    settings.metrics.window_timestamp = WindowTimestamp::Event;
    settings.metrics.store_name = "redis".to_string();
    // windows are closed explicitly by the tests
    settings.metrics.close_interval_ms = 3_600_000;
    settings
}

fn silent_mock() -> MockSinkWriter {
    let mut mock = MockSinkWriter::new();
    mock.expect_name().return_const("mock");
    mock.expect_write().never();
    mock
}

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn row(key: &str, ms: i64) -> FeatureRow {
    FeatureRow::new(key, at(ms)).with_field("trips", Some(FieldValue::Int64(ms)))
}

#[tokio::test]
async fn test_noop_counts_without_windows() {
    let registry = MetricsRegistry::new();
    let writers = SinkWriters::new(Arc::new(silent_mock()), Arc::new(silent_mock()));
    let stage =
        InflightMetrics::with_writers(&settings("none"), &registry, writers, ManualClock::at(0))
            .unwrap();
    assert!(!stage.is_windowed());

    let rows: Vec<_> = (0..100).map(|i| row("fs_a", i * 1_000)).collect();
    stage.process_stream(stream::iter(rows).boxed()).await;

    assert_eq!(stage.count(), 100);
    assert_eq!(stage.open_groups(), 0);
    assert_eq!(stage.close_due_windows().await, 0);
    stage.finish().await;
    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), Some(100));
}

#[tokio::test]
async fn test_unknown_exporter_behaves_like_none() {
    let registry = MetricsRegistry::new();
    let writers = SinkWriters::new(Arc::new(silent_mock()), Arc::new(silent_mock()));
    let stage = InflightMetrics::with_writers(
        &settings("prometheus"),
        &registry,
        writers,
        ManualClock::at(0),
    )
    .unwrap();
    assert!(!stage.is_windowed());

    for i in 0..10 {
        stage.observe(row("fs_a", i));
    }
    stage.finish().await;
    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), Some(10));
    assert_eq!(registry.get("Inflight", LATE_ELEMENTS_DROPPED), None);
}

#[tokio::test]
async fn test_windowed_batches_per_window_and_key() {
    let registry = MetricsRegistry::new();
    let clock = ManualClock::at(0);
    let rows_writer = Arc::new(RecordingWriter::default());
    let values_writer = Arc::new(RecordingWriter::default());
    let stage = InflightMetrics::with_writers(
        &settings("statsd"),
        &registry,
        SinkWriters::new(rows_writer.clone(), values_writer.clone()),
        clock.clone(),
    )
    .unwrap();
    assert!(stage.is_windowed());

    for (key, ms) in [
        ("fs_a", 1_000),
        ("fs_b", 2_000),
        ("fs_a", 4_000),
        ("fs_b", 9_999),
        ("fs_a", 12_000),
    ] {
        stage.observe(row(key, ms));
    }
    assert_eq!(stage.open_groups(), 3);

    clock.set(10_000);
    assert_eq!(stage.close_due_windows().await, 2);
    assert_eq!(stage.open_groups(), 1);
    stage.finish().await;

    let expected = vec![
        (0, "fs_a".to_string(), 2),
        (0, "fs_b".to_string(), 2),
        (10_000, "fs_a".to_string(), 1),
    ];
    assert_eq!(rows_writer.received(), expected);
    assert_eq!(values_writer.received(), expected);

    let target = &rows_writer.targets()[0];
    assert_eq!(target.host, "collector");
    assert_eq!(target.port, 9125);
    assert_eq!(target.store_name, "redis");
    assert_eq!(target.namespace, "Inflight");
    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), Some(5));
}

#[tokio::test]
async fn test_failing_writer_does_not_block_sibling() {
    let registry = MetricsRegistry::new();
    let mut failing = MockSinkWriter::new();
    failing.expect_name().return_const("row_metrics");
    failing.expect_write().times(2).returning(|_, _| {
        Err(SinkError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "collector unavailable",
        )))
    });
    let values_writer = Arc::new(RecordingWriter::default());
    let stage = InflightMetrics::with_writers(
        &settings("statsd"),
        &registry,
        SinkWriters::new(Arc::new(failing), values_writer.clone()),
        ManualClock::at(0),
    )
    .unwrap();

    stage.observe(row("fs_a", 1_000));
    stage.observe(row("fs_b", 1_000));
    stage.finish().await;

    assert_eq!(
        values_writer.received(),
        vec![(0, "fs_a".to_string(), 1), (0, "fs_b".to_string(), 1)]
    );
    assert_eq!(registry.get("Inflight", SINK_WRITE_FAILURES), Some(2));
    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), Some(2));
}

#[tokio::test]
async fn test_invalid_window_rejected_before_any_row() {
    let registry = MetricsRegistry::new();
    for exporter in ["statsd", "none"] {
        let mut settings = settings(exporter);
        settings.metrics.window_size_in_sec_for_feature_value_metric = 0;
        let writers = SinkWriters::new(Arc::new(silent_mock()), Arc::new(silent_mock()));

        let result =
            InflightMetrics::with_writers(&settings, &registry, writers, ManualClock::at(0));
        assert!(result.is_err());
    }
    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), None);
}

#[tokio::test]
async fn test_late_rows_dropped_but_counted() {
    let registry = MetricsRegistry::new();
    let clock = ManualClock::at(0);
    let rows_writer = Arc::new(RecordingWriter::default());
    let values_writer = Arc::new(RecordingWriter::default());
    let stage = InflightMetrics::with_writers(
        &settings("statsd"),
        &registry,
        SinkWriters::new(rows_writer.clone(), values_writer.clone()),
        clock.clone(),
    )
    .unwrap();

    stage.observe(row("fs_a", 1_000));
    clock.set(10_000);
    assert_eq!(stage.close_due_windows().await, 1);

    // its window is gone; no second batch for [0, 10s)
    stage.observe(row("fs_a", 5_000));
    stage.finish().await;

    assert_eq!(rows_writer.received(), vec![(0, "fs_a".to_string(), 1)]);
    assert_eq!(registry.get("Inflight", LATE_ELEMENTS_DROPPED), Some(1));
    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), Some(2));
}

#[tokio::test]
async fn test_allowed_lateness_delays_close() {
    let registry = MetricsRegistry::new();
    let clock = ManualClock::at(0);
    let writer = Arc::new(RecordingWriter::default());
    let mut settings = settings("statsd");
    settings.metrics.allowed_lateness_secs = 5;
    let stage = InflightMetrics::with_writers(
        &settings,
        &registry,
        SinkWriters::new(writer.clone(), Arc::new(RecordingWriter::default())),
        clock.clone(),
    )
    .unwrap();

    stage.observe(row("fs_a", 1_000));
    clock.set(12_000);
    assert_eq!(stage.close_due_windows().await, 0);
    stage.observe(row("fs_a", 8_000));
    clock.set(15_000);
    assert_eq!(stage.close_due_windows().await, 1);
    stage.finish().await;

    assert_eq!(writer.received(), vec![(0, "fs_a".to_string(), 2)]);
}

#[tokio::test]
async fn test_cancel_discards_open_windows() {
    let registry = MetricsRegistry::new();
    let writers = SinkWriters::new(Arc::new(silent_mock()), Arc::new(silent_mock()));
    let stage =
        InflightMetrics::with_writers(&settings("statsd"), &registry, writers, ManualClock::at(0))
            .unwrap();

    for i in 0..20 {
        stage.observe(row(if i % 2 == 0 { "fs_a" } else { "fs_b" }, i * 100));
    }
    assert_eq!(stage.open_groups(), 2);
    stage.cancel().await;

    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), Some(20));
}

#[tokio::test]
async fn test_ingestion_time_windows() {
    let registry = MetricsRegistry::new();
    let clock = ManualClock::at(20_500);
    let writer = Arc::new(RecordingWriter::default());
    let mut settings = settings("statsd");
    settings.metrics.window_timestamp = WindowTimestamp::Ingestion;
    let stage = InflightMetrics::with_writers(
        &settings,
        &registry,
        SinkWriters::new(writer.clone(), Arc::new(RecordingWriter::default())),
        clock.clone(),
    )
    .unwrap();

    // event timestamps are ignored; the observation time decides the window
    stage.observe(row("fs_a", 1_000));
    clock.set(31_000);
    stage.observe(row("fs_a", 1_000));
    stage.finish().await;

    assert_eq!(
        writer.received(),
        vec![(20_000, "fs_a".to_string(), 1), (30_000, "fs_a".to_string(), 1)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counts_exactly_once_under_parallelism() {
    let registry = MetricsRegistry::new();
    let writer = Arc::new(RecordingWriter::default());
    let stage = Arc::new(
        InflightMetrics::with_writers(
            &settings("statsd"),
            &registry,
            SinkWriters::new(writer.clone(), Arc::new(RecordingWriter::default())),
            ManualClock::at(0),
        )
        .unwrap(),
    );

    let tasks: Vec<_> = (0..8)
        .map(|t| {
            let stage = stage.clone();
            tokio::spawn(async move {
                for i in 0..250 {
                    let key = if (t + i) % 2 == 0 { "fs_a" } else { "fs_b" };
                    stage.observe(row(key, i));
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let stage = Arc::try_unwrap(stage).ok().expect("tasks released the stage");
    assert_eq!(stage.count(), 2000);
    stage.finish().await;

    assert_eq!(registry.get("Inflight", ELEMENTS_COUNT), Some(2000));
    assert_eq!(
        writer.received(),
        vec![(0, "fs_a".to_string(), 1000), (0, "fs_b".to_string(), 1000)]
    );
}

#[tokio::test]
async fn test_process_stream_concurrently() {
    let registry = MetricsRegistry::new();
    let mut settings = settings("statsd");
    settings.pipeline.parallelism = 3;
    let writer = Arc::new(RecordingWriter::default());
    let stage = InflightMetrics::with_writers(
        &settings,
        &registry,
        SinkWriters::new(writer.clone(), Arc::new(RecordingWriter::default())),
        ManualClock::at(0),
    )
    .unwrap();

    let rows = (0..30).map(|i| row("fs_a", i * 1_000));
    stage.process_stream(stream::iter(rows).boxed()).await;
    stage.finish().await;

    assert_eq!(
        writer.received(),
        vec![
            (0, "fs_a".to_string(), 10),
            (10_000, "fs_a".to_string(), 10),
            (20_000, "fs_a".to_string(), 10),
        ]
    );
}

#[tokio::test]
async fn test_burst_larger_than_queue_reaches_every_writer() {
    let registry = MetricsRegistry::new();
    let clock = ManualClock::at(0);
    let rows_writer = Arc::new(RecordingWriter::default());
    let values_writer = Arc::new(RecordingWriter::default());
    let mut settings = settings("statsd");
    settings.metrics.channel_capacity = 4;
    let stage = InflightMetrics::with_writers(
        &settings,
        &registry,
        SinkWriters::new(rows_writer.clone(), values_writer.clone()),
        clock.clone(),
    )
    .unwrap();

    for i in 0..50 {
        stage.observe(row(&format!("fs_{i:02}"), 1_000));
        stage.observe(row(&format!("fs_{i:02}"), 11_000));
    }
    clock.set(10_000);
    assert_eq!(stage.close_due_windows().await, 50);
    stage.finish().await;

    let mut expected: Vec<_> = (0..50)
        .flat_map(|i| [(0, format!("fs_{i:02}"), 1), (10_000, format!("fs_{i:02}"), 1)])
        .collect();
    expected.sort();
    assert_eq!(rows_writer.received(), expected);
    assert_eq!(values_writer.received(), expected);
    assert_eq!(registry.get("Inflight", SINK_WRITE_FAILURES), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flush_of_many_groups_with_default_queue() {
    let registry = MetricsRegistry::new();
    let rows_writer = Arc::new(RecordingWriter::default());
    let values_writer = Arc::new(RecordingWriter::default());
    let settings = settings("statsd");
    let groups = settings.metrics.channel_capacity + 500;
    let stage = InflightMetrics::with_writers(
        &settings,
        &registry,
        SinkWriters::new(rows_writer.clone(), values_writer.clone()),
        ManualClock::at(0),
    )
    .unwrap();

    for i in 0..groups {
        stage.observe(row(&format!("fs_{i}"), 1_000));
    }
    assert_eq!(stage.open_groups(), groups);
    stage.finish().await;

    assert_eq!(rows_writer.received().len(), groups);
    assert_eq!(values_writer.received().len(), groups);
}

#[tokio::test(start_paused = true)]
async fn test_background_closer_ships_due_windows() {
    let registry = MetricsRegistry::new();
    let clock = ManualClock::at(0);
    let rows_writer = Arc::new(RecordingWriter::default());
    let values_writer = Arc::new(RecordingWriter::default());
    let mut settings = settings("statsd");
    settings.metrics.close_interval_ms = 100;
    let stage = InflightMetrics::with_writers(
        &settings,
        &registry,
        SinkWriters::new(rows_writer.clone(), values_writer.clone()),
        clock.clone(),
    )
    .unwrap();

    stage.observe(row("fs_a", 1_000));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(stage.open_groups(), 1);

    // no explicit close: the periodic tick must pick it up
    clock.set(10_000);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(stage.open_groups(), 0);
    assert_eq!(rows_writer.received(), vec![(0, "fs_a".to_string(), 1)]);
    assert_eq!(values_writer.received(), vec![(0, "fs_a".to_string(), 1)]);

    stage.finish().await;
    assert_eq!(rows_writer.received().len(), 1);
}
