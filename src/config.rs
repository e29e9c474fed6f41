//! Driver configuration
//!
//! Serde-backed settings with defaults matching the shipped device
//! firmware, loadable from a TOML file and `GSENSOR_`-prefixed environment
//! variables via figment.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Telemetry representation selected for a collection session
///
/// Passed once at construction and propagated; each component switches on
/// it once, not per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Raw accelerometer counts (`DA` frames)
    #[default]
    Raw,
    /// Scale / AC-coupled / envelope values per axis (`AA` frames)
    Derived,
}

impl Mode {
    /// Value written to the run-mode register to select this mode
    pub fn run_mode_value(self) -> u32 {
        match self {
            Mode::Raw => 0,
            Mode::Derived => 1,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Raw => write!(f, "raw"),
            Mode::Derived => write!(f, "derived"),
        }
    }
}

/// Settings for one device link session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Device address
    pub host: String,
    /// Device TCP port
    pub port: u16,
    /// TCP connect deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// How long a command waits for its acknowledgement, milliseconds
    pub ack_timeout_ms: u64,
    /// Bounded wait when enqueueing onto a channel, milliseconds
    pub queue_put_timeout_ms: u64,
    /// Device sample rate; drives the software sample clock
    pub sample_frequency_hz: f64,
    /// Telemetry representation to collect
    pub mode: Mode,
    /// CSV output path; a timestamped file under `save_data/` when unset
    pub output_path: Option<PathBuf>,
    /// Batch writer wake interval, milliseconds
    pub writer_interval_ms: u64,
    /// Samples drained per writer wake
    pub writer_drain_cap: usize,
    /// Outbound coalescing window, milliseconds
    pub send_window_ms: u64,
    /// Outbound coalescing byte cap
    pub send_byte_cap: usize,
    /// Capacity of the frame and byte channels
    pub channel_capacity: usize,
    /// Capacity of the persistence queue feeding the batch writer
    pub persist_capacity: usize,
    /// Settle time between the stop ack and collector shutdown, milliseconds
    pub stop_drain_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.110".to_string(),
            port: 4061,
            connect_timeout_ms: 3_000,
            ack_timeout_ms: 5_000,
            queue_put_timeout_ms: 100,
            sample_frequency_hz: 2_000.0,
            mode: Mode::Raw,
            output_path: None,
            writer_interval_ms: 50,
            writer_drain_cap: 500,
            send_window_ms: 5,
            send_byte_cap: 512,
            channel_capacity: 1_024,
            persist_capacity: 8_192,
            stop_drain_ms: 200,
        }
    }
}

impl LinkConfig {
    /// Load from defaults, an optional TOML file, and `GSENSOR_` env vars
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(LinkConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("GSENSOR_"))
            .extract()
            .map_err(|e| LinkError::config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn queue_put_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_put_timeout_ms)
    }

    pub fn writer_interval(&self) -> Duration {
        Duration::from_millis(self.writer_interval_ms)
    }

    pub fn send_window(&self) -> Duration {
        Duration::from_millis(self.send_window_ms)
    }

    pub fn stop_drain(&self) -> Duration {
        Duration::from_millis(self.stop_drain_ms)
    }

    /// Seconds between samples at the configured rate
    pub fn sample_period(&self) -> f64 {
        1.0 / self.sample_frequency_hz
    }

    /// Configured output path, or a timestamped default
    pub fn resolve_output_path(&self) -> PathBuf {
        match &self.output_path {
            Some(path) => path.clone(),
            None => {
                let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
                PathBuf::from(format!("save_data/{stamp}.csv"))
            }
        }
    }
}
