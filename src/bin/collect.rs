//! Headless collection CLI
//!
//! Connects to the device, reports the firmware version, and collects
//! telemetry into a CSV file for a fixed duration or until Ctrl-C.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gsensor_link::{DeviceClient, LinkConfig, Mode, Sample, SampleSink};

#[derive(Parser, Debug)]
#[command(name = "collect", about = "Collect accelerometer telemetry to CSV")]
struct Args {
    /// Device address
    #[arg(long)]
    host: Option<String>,

    /// Device TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Telemetry mode: raw or derived
    #[arg(long)]
    mode: Option<String>,

    /// Output CSV path (timestamped file under save_data/ by default)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Collection duration in seconds; runs until Ctrl-C when omitted
    #[arg(long)]
    duration: Option<u64>,

    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Counts samples and logs progress once a second's worth arrived
struct ProgressSink {
    count: AtomicU64,
    log_every: u64,
}

impl SampleSink for ProgressSink {
    fn on_sample(&self, sample: &Sample) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.log_every == 0 {
            info!("{} samples, t={:.3}s", n, sample.timestamp());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = LinkConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(mode) = args.mode.as_deref() {
        config.mode = match mode {
            "raw" => Mode::Raw,
            "derived" => Mode::Derived,
            other => anyhow::bail!("unknown mode '{other}', expected raw or derived"),
        };
    }
    if args.output.is_some() {
        config.output_path = args.output;
    }

    let sink = Arc::new(ProgressSink {
        count: AtomicU64::new(0),
        log_every: config.sample_frequency_hz as u64,
    });

    let mut client = DeviceClient::connect(config.clone(), sink.clone())
        .await
        .context("connecting to device")?;
    tracing::debug!("session: {}", client.diagnostics());

    match client.firmware_version().await {
        Ok(version) => info!("firmware version {}", version),
        Err(e) => warn!("could not read firmware version: {}", e),
    }

    client
        .set_run_mode(config.mode)
        .await
        .context("selecting run mode")?;
    let output = client.start_collection().await.context("starting collection")?;
    info!("collecting to {}", output.display());

    match args.duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await.ok();
            info!("interrupted, stopping");
        }
    }

    let output = client.stop_collection().await.context("stopping collection")?;
    info!(
        "done: {} samples -> {}",
        sink.count.load(Ordering::Relaxed),
        output.display()
    );
    client.shutdown().await?;
    Ok(())
}
