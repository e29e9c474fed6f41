//! Frame classification
//!
//! Routes each decoded frame, whole and unexamined beyond its function
//! code, onto exactly one channel queue. Payload semantics stay out of this
//! layer so layouts can change without touching classification.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::frame::{Frame, FunctionCode};

/// Receiver ends of the four logical channels
pub struct RouterChannels {
    /// Raw accelerometer telemetry (`DA`)
    pub telemetry_raw: mpsc::Receiver<Frame>,
    /// Derived telemetry (`AA`)
    pub telemetry_derived: mpsc::Receiver<Frame>,
    /// Device event text (`EV`)
    pub event: mpsc::Receiver<Frame>,
    /// Everything else: command acknowledgements
    pub ack: mpsc::Receiver<Frame>,
}

/// Classifies frames by function code into channel queues
///
/// Enqueues block up to the put timeout; a stalled consumer costs the item,
/// not the pipeline (liveness over delivery).
pub struct FrameRouter {
    telemetry_raw_tx: mpsc::Sender<Frame>,
    telemetry_derived_tx: mpsc::Sender<Frame>,
    event_tx: mpsc::Sender<Frame>,
    ack_tx: mpsc::Sender<Frame>,
    put_timeout: Duration,
}

impl FrameRouter {
    /// Create the router and the four channel receivers it feeds
    pub fn new(capacity: usize, put_timeout: Duration) -> (Self, RouterChannels) {
        let (telemetry_raw_tx, telemetry_raw) = mpsc::channel(capacity);
        let (telemetry_derived_tx, telemetry_derived) = mpsc::channel(capacity);
        let (event_tx, event) = mpsc::channel(capacity);
        let (ack_tx, ack) = mpsc::channel(capacity);
        (
            Self {
                telemetry_raw_tx,
                telemetry_derived_tx,
                event_tx,
                ack_tx,
                put_timeout,
            },
            RouterChannels {
                telemetry_raw,
                telemetry_derived,
                event,
                ack,
            },
        )
    }

    /// Place a frame on its channel
    pub async fn route(&self, frame: Frame) {
        let (label, tx) = match frame.function_code() {
            FunctionCode::TELEMETRY_RAW => ("telemetry-raw", &self.telemetry_raw_tx),
            FunctionCode::TELEMETRY_DERIVED => ("telemetry-derived", &self.telemetry_derived_tx),
            FunctionCode::EVENT => ("event", &self.event_tx),
            _ => ("ack", &self.ack_tx),
        };

        match tx.send_timeout(frame, self.put_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(frame)) => {
                warn!(
                    "{} queue full for {:?}, dropped {} frame",
                    label,
                    self.put_timeout,
                    frame.function_code()
                );
            }
            Err(SendTimeoutError::Closed(frame)) => {
                debug!(
                    "{} queue closed, dropped {} frame",
                    label,
                    frame.function_code()
                );
            }
        }
    }
}
