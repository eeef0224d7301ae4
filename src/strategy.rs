use std::time::Duration;
use tracing::warn;

use crate::config::{MetricsSettings, WindowTimestamp};
use crate::error::InflightResult;

/// Branch taken by a stage instance. Chosen once when the stage is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExporterStrategy {
    Windowed(WindowedExport),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowedExport {
    pub host: String,
    pub port: u16,
    pub window_size: Duration,
    pub window_timestamp: WindowTimestamp,
    pub allowed_lateness: Duration,
    pub close_interval: Duration,
}

impl ExporterStrategy {
    /// Resolves the exporter type. Unknown or missing types fall back to the
    /// no-op branch; only invalid settings are an error.
    pub fn select(settings: &MetricsSettings) -> InflightResult<Self> {
        settings.validate()?;

        let exporter = settings
            .exporter_type
            .as_deref()
            .map(|t| t.trim().to_ascii_lowercase());

        match exporter.as_deref() {
            Some("statsd") => Ok(ExporterStrategy::Windowed(WindowedExport {
                host: settings.statsd_host.clone(),
                port: settings.statsd_port,
                window_size: settings.window_size()?,
                window_timestamp: settings.window_timestamp,
                allowed_lateness: settings.allowed_lateness(),
                close_interval: settings.close_interval(),
            })),
            Some("none") | None => Ok(ExporterStrategy::None),
            Some(other) => {
                warn!(exporter_type = other, "unknown metrics exporter type, metrics export disabled");
                Ok(ExporterStrategy::None)
            }
        }
    }

    pub fn is_windowed(&self) -> bool {
        matches!(self, ExporterStrategy::Windowed(_))
    }
}
