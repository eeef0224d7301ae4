use clap::Parser;
use futures::StreamExt;
use inflight_metrics::shutdown::termination_signal;
use inflight_metrics::{FeatureRow, InflightMetrics, InflightSettings, MetricsRegistry, Overrides};
use std::path::PathBuf;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Counts newline-delimited JSON feature rows read from stdin and, with the
/// statsd exporter, ships windowed summaries to the collector.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct CliArgs {
    /// Path to a configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Metrics exporter: statsd or none
    #[arg(long, env = "INFLIGHT_EXPORTER_TYPE")]
    exporter_type: Option<String>,

    /// StatsD collector host
    #[arg(long, env = "INFLIGHT_STATSD_HOST")]
    statsd_host: Option<String>,

    /// StatsD collector port
    #[arg(long, env = "INFLIGHT_STATSD_PORT")]
    statsd_port: Option<u16>,

    /// Tumbling window length in seconds for feature value metrics
    #[arg(long, env = "INFLIGHT_WINDOW_SIZE")]
    window_size: Option<i64>,

    /// Store name attached to emitted metrics
    #[arg(long, env = "INFLIGHT_STORE_NAME")]
    store_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let overrides = Overrides {
        exporter_type: args.exporter_type,
        statsd_host: args.statsd_host,
        statsd_port: args.statsd_port,
        window_size_secs: args.window_size,
        store_name: args.store_name,
    };
    let settings = InflightSettings::load(args.config.as_deref(), overrides)?;

    let registry = MetricsRegistry::new();
    let stage = InflightMetrics::new(&settings, &registry)?;

    let rows = LinesStream::new(BufReader::new(stdin()).lines())
        .filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => match serde_json::from_str::<FeatureRow>(&line) {
                    Ok(row) => Some(row),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed feature row");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "failed to read input");
                    None
                }
            }
        })
        .boxed();

    let cancelled = tokio::select! {
        _ = stage.process_stream(rows) => false,
        _ = termination_signal() => true,
    };

    if cancelled {
        info!("termination requested, cancelling");
        stage.cancel().await;
    } else {
        stage.finish().await;
    }

    for (name, value) in registry.snapshot() {
        info!(metric = %name, value, "counter");
    }
    Ok(())
}
