//! gsensor-link
//!
//! Async TCP driver for a WiFi accelerometer/IMU that streams telemetry and
//! accepts register-style commands over a compact, self-framed binary
//! protocol.
//!
//! # Architecture
//!
//! - **Transport**: owns the socket; independent reader and coalescing
//!   writer loops feeding bounded queues
//! - **FrameDecoder**: resynchronizing scanner turning raw chunks into
//!   validated frames
//! - **FrameRouter**: function-code classification onto telemetry, event,
//!   and acknowledgement channels
//! - **CommandService**: start/stop and register read/write with
//!   timeout-bound ack correlation
//! - **TelemetryCollector**: payload decode, sample-clock timestamps,
//!   display and persistence hand-off
//! - **BatchWriter**: interval-driven CSV appends with bounded per-wake
//!   drain
//!
//! [`DeviceClient`] wires a session together; the lower layers stay public
//! for embedders that need their own composition.

pub mod client;
pub mod collector;
pub mod command;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod registers;
pub mod router;
pub mod transport;
pub mod writer;

// Re-export core types
pub use client::DeviceClient;
pub use collector::{NullSink, Sample, SampleSink, TelemetryCollector};
pub use command::CommandService;
pub use config::{LinkConfig, Mode};
pub use decoder::FrameDecoder;
pub use error::{LinkError, Result};
pub use frame::{Frame, FunctionCode};
pub use registers::{ControlWord, FirmwareVersion, RegisterAddress};
pub use router::{FrameRouter, RouterChannels};
pub use transport::{ConnectionState, Transport, TransportHandle};
pub use writer::BatchWriter;
