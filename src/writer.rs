//! CSV batch writer
//!
//! Wakes on a fixed interval and appends queued samples to the output file.
//! The per-wake drain is bounded so a burst cannot stretch wake latency;
//! whatever remains waits for the next wake. The writer itself never drops
//! a sample: once the upstream channel closes it keeps flushing until the
//! backlog is empty, then exits.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::Mode;
use crate::error::Result;
use crate::collector::Sample;

/// Column headers for raw-mode output
const RAW_HEADER: [&str; 4] = ["Time", "Accel_X", "Accel_Y", "Accel_Z"];
/// Column headers for derived-mode output. Spelling is load-bearing:
/// existing downstream consumers match these names verbatim.
const DERIVED_HEADER: [&str; 13] = [
    "Time",
    "Scale_X",
    "Scale_Y",
    "Scale_Z",
    "AC_Couple_X",
    "AC_Couple_Y",
    "AC_Couple_Z",
    "Evelope_Upper_X",
    "Evelope_Upper_Y",
    "Evelope_Upper_Z",
    "Evelope_Low_X",
    "Evelope_Low_Y",
    "Evelope_Low_Z",
];

/// Header row for a mode's CSV schema
pub fn csv_header(mode: Mode) -> &'static [&'static str] {
    match mode {
        Mode::Raw => &RAW_HEADER,
        Mode::Derived => &DERIVED_HEADER,
    }
}

fn csv_row(sample: &Sample) -> Vec<String> {
    match sample {
        Sample::Raw {
            timestamp,
            accel_x,
            accel_y,
            accel_z,
        } => vec![
            timestamp.to_string(),
            accel_x.to_string(),
            accel_y.to_string(),
            accel_z.to_string(),
        ],
        Sample::Derived {
            timestamp,
            scale,
            ac_couple,
            envelope_high,
            envelope_low,
        } => {
            let mut row = Vec::with_capacity(13);
            row.push(timestamp.to_string());
            for group in [scale, ac_couple, envelope_high, envelope_low] {
                row.extend(group.iter().map(|v| v.to_string()));
            }
            row
        }
    }
}

/// Pull up to `cap` queued samples without waiting
///
/// Returns the batch and whether the channel has closed (no producer left).
fn drain_ready(rx: &mut mpsc::Receiver<Sample>, cap: usize) -> (Vec<Sample>, bool) {
    let mut batch = Vec::new();
    while batch.len() < cap {
        match rx.try_recv() {
            Ok(sample) => batch.push(sample),
            Err(TryRecvError::Empty) => return (batch, false),
            Err(TryRecvError::Disconnected) => return (batch, true),
        }
    }
    (batch, false)
}

/// Interval-driven CSV appender
pub struct BatchWriter {
    path: PathBuf,
    mode: Mode,
    wake_interval: Duration,
    drain_cap: usize,
}

impl BatchWriter {
    pub fn new(path: PathBuf, mode: Mode, wake_interval: Duration, drain_cap: usize) -> Self {
        Self {
            path,
            mode,
            wake_interval,
            drain_cap,
        }
    }

    /// Output file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of samples, creating the directory, file, and header
    /// row on first contact
    pub fn flush(&self, batch: &[Sample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file_existed = self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::Writer::from_writer(file);
        if !file_existed {
            writer.write_record(csv_header(self.mode))?;
        }
        for sample in batch {
            writer.write_record(csv_row(sample))?;
        }
        writer.flush().map_err(|e| crate::error::LinkError::Csv(e.to_string()))?;
        debug!("flushed {} row(s) to {}", batch.len(), self.path.display());
        Ok(())
    }

    /// Run until the persistence channel closes and the backlog is flushed
    ///
    /// Flush errors are logged and the loop continues; losing one wake's
    /// rows to a transient filesystem error must not kill persistence.
    pub async fn run(self, mut rx: mpsc::Receiver<Sample>) {
        let mut ticker = interval(self.wake_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total: u64 = 0;

        loop {
            ticker.tick().await;
            let (batch, closed) = drain_ready(&mut rx, self.drain_cap);
            total += batch.len() as u64;
            if let Err(e) = self.flush(&batch) {
                error!("CSV save error: {}", e);
            }

            if closed {
                // Producers are gone: flush the rest in capped batches and
                // finish.
                loop {
                    let (rest, _) = drain_ready(&mut rx, self.drain_cap);
                    if rest.is_empty() {
                        break;
                    }
                    total += rest.len() as u64;
                    if let Err(e) = self.flush(&rest) {
                        error!("CSV save error: {}", e);
                    }
                }
                info!("batch writer done, {} row(s) -> {}", total, self.path.display());
                return;
            }
        }
    }
}
