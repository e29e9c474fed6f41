//! Telemetry collection
//!
//! Drains the mode-selected telemetry channel, decodes the fixed binary
//! payload layouts into samples, stamps them with the software sample
//! clock, and forwards each to the display sink and the persistence queue.
//! A decode failure costs the frame, never the loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Mode;
use crate::error::{LinkError, Result};
use crate::frame::{Frame, FunctionCode};

/// Raw-mode payload with only accelerometer fields
const RAW_ACCEL_PAYLOAD_LEN: usize = 9;
/// Raw-mode payload carrying accelerometer and gyro fields
const RAW_ACCEL_GYRO_PAYLOAD_LEN: usize = 15;
/// Derived-mode payload: twelve f32 values plus counter
const DERIVED_PAYLOAD_LEN: usize = 51;

/// One decoded telemetry record
///
/// The timestamp comes from a software clock advanced by the sample period,
/// not from the device; the on-wire counter is observed but unused, so a
/// lost frame shifts later timestamps rather than leaving a gap.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Raw {
        timestamp: f64,
        accel_x: i16,
        accel_y: i16,
        accel_z: i16,
    },
    Derived {
        timestamp: f64,
        scale: [f32; 3],
        ac_couple: [f32; 3],
        envelope_high: [f32; 3],
        envelope_low: [f32; 3],
    },
}

impl Sample {
    pub fn timestamp(&self) -> f64 {
        match self {
            Sample::Raw { timestamp, .. } | Sample::Derived { timestamp, .. } => *timestamp,
        }
    }
}

/// Live-display hand-off
///
/// Invoked from the collector task, so implementations must tolerate
/// non-UI threads. Calls are fire-and-forget; a slow sink loses frames on
/// its own side, never here.
pub trait SampleSink: Send + Sync {
    fn on_sample(&self, sample: &Sample);
}

/// Sink that discards everything, for headless sessions
#[derive(Debug, Default)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn on_sample(&self, _sample: &Sample) {}
}

/// Decode a raw-mode payload (either accel-only or accel+gyro layout)
///
/// The gyro fields of the longer layout are skipped; the sample model keeps
/// acceleration only. The byte past the last field mirrors the end-marker
/// slot and is not read.
fn decode_raw(payload: &[u8], timestamp: f64) -> Result<Sample> {
    let mut fields = payload;
    match payload.len() {
        RAW_ACCEL_PAYLOAD_LEN | RAW_ACCEL_GYRO_PAYLOAD_LEN => {
            let accel_x = fields.get_i16_le();
            let accel_y = fields.get_i16_le();
            let accel_z = fields.get_i16_le();
            if payload.len() == RAW_ACCEL_GYRO_PAYLOAD_LEN {
                fields.advance(6); // gyro x/y/z, unused
            }
            let _counter = fields.get_u16_le();
            Ok(Sample::Raw {
                timestamp,
                accel_x,
                accel_y,
                accel_z,
            })
        }
        len => Err(LinkError::DecodeLength {
            function: FunctionCode::TELEMETRY_RAW,
            len,
        }),
    }
}

/// Decode a derived-mode payload: scale, AC-coupled, and envelope bounds
/// per axis
fn decode_derived(payload: &[u8], timestamp: f64) -> Result<Sample> {
    if payload.len() != DERIVED_PAYLOAD_LEN {
        return Err(LinkError::DecodeLength {
            function: FunctionCode::TELEMETRY_DERIVED,
            len: payload.len(),
        });
    }
    let mut fields = payload;
    let mut take3 = || {
        [
            fields.get_f32_le(),
            fields.get_f32_le(),
            fields.get_f32_le(),
        ]
    };
    let scale = take3();
    let ac_couple = take3();
    let envelope_high = take3();
    let envelope_low = take3();
    Ok(Sample::Derived {
        timestamp,
        scale,
        ac_couple,
        envelope_high,
        envelope_low,
    })
}

/// Decode one telemetry frame for the given mode
pub fn decode_sample(mode: Mode, frame: &Frame, timestamp: f64) -> Result<Sample> {
    match mode {
        Mode::Raw => decode_raw(frame.payload(), timestamp),
        Mode::Derived => decode_derived(frame.payload(), timestamp),
    }
}

/// Collector loop state
pub struct TelemetryCollector {
    mode: Mode,
    sample_period: f64,
    sink: Arc<dyn SampleSink>,
    persist_tx: mpsc::Sender<Sample>,
    put_timeout: Duration,
}

impl TelemetryCollector {
    pub fn new(
        mode: Mode,
        sample_period: f64,
        sink: Arc<dyn SampleSink>,
        persist_tx: mpsc::Sender<Sample>,
        put_timeout: Duration,
    ) -> Self {
        Self {
            mode,
            sample_period,
            sink,
            persist_tx,
            put_timeout,
        }
    }

    /// Consume the telemetry channel until it closes or collection stops
    ///
    /// On cancellation, frames already queued are drained and forwarded
    /// before the loop exits, so nothing decoded is stranded upstream of
    /// the writer.
    pub async fn run(self, mut telemetry_rx: mpsc::Receiver<Frame>, cancel: CancellationToken) {
        let mut timestamp = 0.0f64;
        let mut accepted: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(frame) = telemetry_rx.try_recv() {
                        self.handle_frame(&frame, &mut timestamp, &mut accepted).await;
                    }
                    debug!("collector stopped after {} sample(s)", accepted);
                    return;
                }
                frame = telemetry_rx.recv() => match frame {
                    Some(frame) => {
                        self.handle_frame(&frame, &mut timestamp, &mut accepted).await;
                    }
                    None => {
                        debug!("telemetry channel closed after {} sample(s)", accepted);
                        return;
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &Frame, timestamp: &mut f64, accepted: &mut u64) {
        let sample = match decode_sample(self.mode, frame, *timestamp) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("dropped telemetry frame: {}", e);
                return;
            }
        };
        *timestamp += self.sample_period;
        *accepted += 1;

        self.sink.on_sample(&sample);

        match self.persist_tx.send_timeout(sample, self.put_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(sample)) => {
                warn!(
                    "persistence queue full, dropped sample at t={}",
                    sample.timestamp()
                );
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!("persistence queue closed");
            }
        }
    }
}

/// Log device event frames as they arrive
pub async fn run_event_logger(mut event_rx: mpsc::Receiver<Frame>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = event_rx.recv() => match frame {
                Some(frame) => {
                    let text = String::from_utf8_lossy(frame.payload());
                    let text = text.trim_end_matches(['\u{3}', '\0', '\r', '\n']);
                    info!("device event: {}", text);
                }
                None => return,
            }
        }
    }
}
