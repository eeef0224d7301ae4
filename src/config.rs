//! Settings for the inflight metrics stage.
//!
//! Sources are layered with the `config` crate, later ones overriding
//! earlier ones:
//! 1. serde defaults
//! 2. `config/default.toml` and `config/local.toml` (both optional)
//! 3. an explicit file, usually given with `--config`
//! 4. environment variables prefixed with `INFLIGHT_`, sections separated by
//!    a double underscore (`INFLIGHT_METRICS__EXPORTER_TYPE=statsd`)
//! 5. overrides set by the caller (command-line flags)

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{InflightError, InflightResult};

pub const DEFAULT_NAMESPACE: &str = "Inflight";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InflightSettings {
    pub metrics: MetricsSettings,
    pub pipeline: PipelineSettings,
}

/// Options read once per stage instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// `statsd` or `none`. Anything else is treated as `none`.
    pub exporter_type: Option<String>,
    pub statsd_host: String,
    pub statsd_port: u16,
    /// Tumbling window length. Signed so that non-positive values coming
    /// from files or the environment are rejected instead of wrapped.
    pub window_size_in_sec_for_feature_value_metric: i64,
    /// Logical destination store, attached as a tag to every summary.
    pub store_name: String,
    pub namespace: String,
    pub window_timestamp: WindowTimestamp,
    pub allowed_lateness_secs: u64,
    pub close_interval_ms: u64,
    pub sink_timeout_ms: u64,
    pub channel_capacity: usize,
}

/// Which instant decides the window a row falls into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowTimestamp {
    /// Time the stage observed the row.
    #[default]
    Ingestion,
    /// The row's own `event_timestamp`.
    Event,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Upper bound on rows processed concurrently by `process_stream`.
    pub parallelism: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            exporter_type: Some("none".to_string()),
            statsd_host: "localhost".to_string(),
            statsd_port: 8125,
            window_size_in_sec_for_feature_value_metric: 30,
            store_name: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            window_timestamp: WindowTimestamp::Ingestion,
            allowed_lateness_secs: 0,
            close_interval_ms: 1000,
            sink_timeout_ms: 5000,
            channel_capacity: 1024,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { parallelism: 8 }
    }
}

impl MetricsSettings {
    /// Window length, rejecting non-positive sizes and sizes whose length in
    /// milliseconds does not fit an `i64`.
    pub fn window_size(&self) -> InflightResult<Duration> {
        let secs = self.window_size_in_sec_for_feature_value_metric;
        if secs <= 0 {
            return Err(InflightError::InvalidConfig(format!(
                "window_size_in_sec_for_feature_value_metric must be positive, got {secs}"
            )));
        }
        if secs.checked_mul(1000).is_none() {
            return Err(InflightError::InvalidConfig(format!(
                "window_size_in_sec_for_feature_value_metric is out of range, got {secs}"
            )));
        }
        Ok(Duration::from_secs(secs.unsigned_abs()))
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_secs(self.allowed_lateness_secs)
    }

    pub fn close_interval(&self) -> Duration {
        Duration::from_millis(self.close_interval_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn validate(&self) -> InflightResult<()> {
        self.window_size()?;
        let lateness_ms = i64::try_from(self.allowed_lateness_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(1000));
        if lateness_ms.is_none() {
            return Err(InflightError::InvalidConfig(format!(
                "allowed_lateness_secs is out of range, got {}",
                self.allowed_lateness_secs
            )));
        }
        if self.close_interval_ms == 0 {
            return Err(InflightError::InvalidConfig(
                "close_interval_ms must be positive".to_string(),
            ));
        }
        if self.sink_timeout_ms == 0 {
            return Err(InflightError::InvalidConfig(
                "sink_timeout_ms must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(InflightError::InvalidConfig(
                "channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl InflightSettings {
    /// Loads settings from the default locations and the environment.
    pub fn new() -> InflightResult<Self> {
        Self::load(None, Overrides::default())
    }

    pub fn load(path: Option<&Path>, overrides: Overrides) -> InflightResult<Self> {
        let config_dir = Path::new("config");

        let mut builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("INFLIGHT")
                .prefix_separator("_")
                .separator("__"),
        );

        Self::build(overrides.apply(builder)?)
    }

    /// Parses settings from a TOML document, ignoring files and environment.
    pub fn from_toml_str(toml: &str) -> InflightResult<Self> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> InflightResult<Self> {
        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> InflightResult<()> {
        self.metrics.validate()?;
        if self.pipeline.parallelism == 0 {
            return Err(InflightError::InvalidConfig(
                "parallelism must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Highest-precedence values, typically taken from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub exporter_type: Option<String>,
    pub statsd_host: Option<String>,
    pub statsd_port: Option<u16>,
    pub window_size_secs: Option<i64>,
    pub store_name: Option<String>,
}

impl Overrides {
    fn apply(
        self,
        builder: ConfigBuilder<DefaultState>,
    ) -> InflightResult<ConfigBuilder<DefaultState>> {
        Ok(builder
            .set_override_option("metrics.exporter_type", self.exporter_type)?
            .set_override_option("metrics.statsd_host", self.statsd_host)?
            .set_override_option("metrics.statsd_port", self.statsd_port.map(i64::from))?
            .set_override_option(
                "metrics.window_size_in_sec_for_feature_value_metric",
                self.window_size_secs,
            )?
            .set_override_option("metrics.store_name", self.store_name)?)
    }
}
