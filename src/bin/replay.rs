//! CSV replay tool
//!
//! Streams a previously recorded raw-mode CSV back at the device as raw
//! sample frames, pacing the bursts the way the capture tooling does.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gsensor_link::{DeviceClient, LinkConfig};

/// Counts-per-g scale applied to the recorded acceleration columns
const ACCEL_SCALE: f64 = 8192.0;
/// Frames sent between pacing sleeps
const BURST_LEN: u64 = 5;
/// Counter wrap point, matching the device's own counter range
const COUNTER_WRAP: u16 = 10_000;

#[derive(Parser, Debug)]
#[command(name = "replay", about = "Replay a recorded CSV as raw telemetry frames")]
struct Args {
    /// Recorded raw-mode CSV file
    file: PathBuf,

    /// Device address
    #[arg(long)]
    host: Option<String>,

    /// Device TCP port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = LinkConfig::load(None)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let client = DeviceClient::connect_headless(config)
        .await
        .context("connecting to device")?;

    let mut reader = csv::Reader::from_path(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;

    let mut counter: u16 = 0;
    let mut sent: u64 = 0;
    for record in reader.records() {
        let record = record.context("reading CSV record")?;
        let accel = |idx: usize| -> anyhow::Result<i16> {
            let value: f64 = record
                .get(idx)
                .with_context(|| format!("missing column {idx}"))?
                .trim()
                .parse()?;
            Ok((value * ACCEL_SCALE) as i16)
        };
        let (ax, ay, az) = (accel(1)?, accel(2)?, accel(3)?);

        client.send_raw_sample(ax, ay, az, counter).await?;
        counter = (counter + 1) % COUNTER_WRAP;
        sent += 1;

        if sent % BURST_LEN == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    info!("transmit finished, {} frame(s)", sent);
    client.shutdown().await?;
    Ok(())
}
