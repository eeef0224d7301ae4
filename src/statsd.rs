//! StatsD writers for the windowed branch.
//!
//! Both writers encode a closed batch into DogStatsD lines tagged with the
//! store name and feature set reference, then ship them over UDP. Lines are
//! packed into datagrams that stay below a typical path MTU.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::error::SinkError;
use crate::sink::{MetricsSinkWriter, SinkTarget};
use crate::window::GroupedBatch;

const MAX_PACKET_BYTES: usize = 1432;

const STORE_TAG: &str = "feast_store";
const FEATURE_SET_TAG: &str = "feast_feature_set_ref";
const FEATURE_NAME_TAG: &str = "feast_feature_name";

/// UDP transport shared by the writers. Every send is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct StatsdClient {
    timeout: Duration,
}

impl StatsdClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn send(&self, host: &str, port: u16, lines: &[String]) -> Result<(), SinkError> {
        if lines.is_empty() {
            return Ok(());
        }
        match tokio::time::timeout(self.timeout, send_lines(host, port, lines)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout {
                endpoint: format!("{host}:{port}"),
                timeout: self.timeout,
            }),
        }
    }
}

async fn send_lines(host: &str, port: u16, lines: &[String]) -> Result<(), SinkError> {
    let addr = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| SinkError::Resolve(format!("{host}:{port}")))?;
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let packets = pack(lines, MAX_PACKET_BYTES);
    for packet in &packets {
        socket.send(packet.as_bytes()).await?;
    }
    debug!(%addr, lines = lines.len(), packets = packets.len(), "sent statsd metrics");
    Ok(())
}

/// Joins lines with newlines into packets of at most `max_bytes`. A single
/// line longer than the limit is sent on its own.
fn pack(lines: &[String], max_bytes: usize) -> Vec<String> {
    let mut packets = Vec::new();
    let mut current = String::new();
    for line in lines {
        if !current.is_empty() && current.len() + 1 + line.len() > max_bytes {
            packets.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        packets.push(current);
    }
    packets
}

/// Min, max, mean and nearest-rank percentiles over a set of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    sorted: Vec<f64>,
    mean: f64,
}

impl Summary {
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        values.retain(|v| v.is_finite());
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Some(Self {
            sorted: values,
            mean,
        })
    }

    pub fn min(&self) -> f64 {
        self.sorted[0]
    }

    pub fn max(&self) -> f64 {
        self.sorted[self.sorted.len() - 1]
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn percentile(&self, p: f64) -> f64 {
        let n = self.sorted.len();
        let rank = ((p / 100.0) * n as f64).ceil() as usize;
        self.sorted[rank.clamp(1, n) - 1]
    }
}

fn tags(target: &SinkTarget, batch: &GroupedBatch) -> String {
    format!(
        "{STORE_TAG}:{},{FEATURE_SET_TAG}:{}",
        target.store_name, batch.key
    )
}

fn counter_line(namespace: &str, name: &str, value: u64, tags: &str) -> String {
    format!("{namespace}.{name}:{value}|c|#{tags}")
}

fn gauge_line(namespace: &str, name: &str, value: f64, tags: &str) -> String {
    format!("{namespace}.{name}:{value}|g|#{tags}")
}

/// Row presence, count and ingestion lag per batch.
#[derive(Debug, Clone)]
pub struct StatsdRowMetricsWriter {
    client: StatsdClient,
}

impl StatsdRowMetricsWriter {
    pub fn new(client: StatsdClient) -> Self {
        Self { client }
    }

    pub fn encode(target: &SinkTarget, batch: &GroupedBatch, now_ms: i64) -> Vec<String> {
        let ns = target.namespace.as_str();
        let tags = tags(target, batch);
        let mut lines = vec![counter_line(
            ns,
            "feature_row_ingested_count",
            batch.rows.len() as u64,
            &tags,
        )];

        let lags = batch
            .rows
            .iter()
            .map(|row| (now_ms - row.event_timestamp.timestamp_millis()).max(0) as f64)
            .collect();
        if let Some(lag) = Summary::from_values(lags) {
            let stats = [
                ("min", lag.min()),
                ("max", lag.max()),
                ("mean", lag.mean()),
                ("p50", lag.percentile(50.0)),
                ("p90", lag.percentile(90.0)),
                ("p95", lag.percentile(95.0)),
                ("p99", lag.percentile(99.0)),
            ];
            for (stat, value) in stats {
                lines.push(gauge_line(ns, &format!("feature_row_lag_ms_{stat}"), value, &tags));
            }
        }

        let mut missing: BTreeMap<&str, u64> = BTreeMap::new();
        for field in batch.rows.iter().flat_map(|row| &row.fields) {
            let count = missing.entry(field.name.as_str()).or_default();
            if field.value.is_none() {
                *count += 1;
            }
        }
        for (name, count) in missing {
            lines.push(counter_line(
                ns,
                "feature_value_missing_count",
                count,
                &format!("{tags},{FEATURE_NAME_TAG}:{name}"),
            ));
        }

        lines
    }
}

#[async_trait]
impl MetricsSinkWriter for StatsdRowMetricsWriter {
    fn name(&self) -> &'static str {
        "row_metrics"
    }

    async fn write(&self, target: &SinkTarget, batch: &GroupedBatch) -> Result<(), SinkError> {
        let lines = Self::encode(target, batch, Utc::now().timestamp_millis());
        self.client.send(&target.host, target.port, &lines).await
    }
}

/// Distribution of each numeric feature value per batch.
#[derive(Debug, Clone)]
pub struct StatsdFeatureValueMetricsWriter {
    client: StatsdClient,
}

impl StatsdFeatureValueMetricsWriter {
    pub fn new(client: StatsdClient) -> Self {
        Self { client }
    }

    pub fn encode(target: &SinkTarget, batch: &GroupedBatch) -> Vec<String> {
        let ns = target.namespace.as_str();
        let tags = tags(target, batch);

        let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for field in batch.rows.iter().flat_map(|row| &row.fields) {
            if let Some(v) = field.value.as_ref().and_then(|v| v.as_f64()) {
                values.entry(field.name.as_str()).or_default().push(v);
            }
        }

        let mut lines = Vec::new();
        for (name, values) in values {
            let Some(summary) = Summary::from_values(values) else {
                continue;
            };
            let feature_tags = format!("{tags},{FEATURE_NAME_TAG}:{name}");
            let stats = [
                ("min", summary.min()),
                ("max", summary.max()),
                ("mean", summary.mean()),
                ("p25", summary.percentile(25.0)),
                ("p50", summary.percentile(50.0)),
                ("p90", summary.percentile(90.0)),
                ("p95", summary.percentile(95.0)),
                ("p99", summary.percentile(99.0)),
            ];
            for (stat, value) in stats {
                lines.push(gauge_line(ns, &format!("feature_{stat}"), value, &feature_tags));
            }
        }
        lines
    }
}

#[async_trait]
impl MetricsSinkWriter for StatsdFeatureValueMetricsWriter {
    fn name(&self) -> &'static str {
        "feature_value_metrics"
    }

    async fn write(&self, target: &SinkTarget, batch: &GroupedBatch) -> Result<(), SinkError> {
        let lines = Self::encode(target, batch);
        self.client.send(&target.host, target.port, &lines).await
    }
}
