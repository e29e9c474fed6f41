//! Device client
//!
//! Composition root for one device session: wires the transport, decoder,
//! router, command service, collector, and batch writer together and owns
//! their lifecycles. Collection runs as a set of tasks communicating only
//! through the channel queues; stopping first quiesces the device, then
//! lets the in-flight frames drain before tearing the tasks down.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::{run_event_logger, NullSink, SampleSink, TelemetryCollector};
use crate::command::CommandService;
use crate::config::{LinkConfig, Mode};
use crate::decoder::decode_loop;
use crate::error::{LinkError, Result};
use crate::frame::Frame;
use crate::registers::{FirmwareVersion, RegisterAddress};
use crate::router::FrameRouter;
use crate::transport::{ConnectionState, Transport};
use crate::writer::BatchWriter;

/// Handles for a running collection session
struct Collection {
    cancel: CancellationToken,
    collector: JoinHandle<()>,
    writer: JoinHandle<()>,
    output_path: PathBuf,
}

/// One connected device session
pub struct DeviceClient {
    config: LinkConfig,
    transport: Arc<Transport>,
    commands: CommandService,
    sink: Arc<dyn SampleSink>,
    cancel: CancellationToken,
    telemetry_raw: Option<mpsc::Receiver<Frame>>,
    telemetry_derived: Option<mpsc::Receiver<Frame>>,
    collection: Option<Collection>,
}

impl DeviceClient {
    /// Connect to the device and spawn the engine loops
    ///
    /// The sink receives every decoded sample during collection; pass
    /// [`NullSink`] for headless use.
    pub async fn connect(config: LinkConfig, sink: Arc<dyn SampleSink>) -> Result<Self> {
        let cancel = CancellationToken::new();

        let (transport, byte_rx) = Transport::connect(&config, cancel.child_token()).await?;
        let transport = Arc::new(transport);

        let (router, channels) = FrameRouter::new(config.channel_capacity, config.queue_put_timeout());

        let state = transport.state_watch();
        let decode_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = decode_loop(byte_rx, router, state, decode_cancel).await {
                error!("decode loop ended: {}", e);
            }
        });
        tokio::spawn(run_event_logger(channels.event, cancel.child_token()));

        let commands = CommandService::new(transport.handle(), channels.ack, config.ack_timeout());

        Ok(Self {
            config,
            transport,
            commands,
            sink,
            cancel,
            telemetry_raw: Some(channels.telemetry_raw),
            telemetry_derived: Some(channels.telemetry_derived),
            collection: None,
        })
    }

    /// Convenience constructor without a display sink
    pub async fn connect_headless(config: LinkConfig) -> Result<Self> {
        Self::connect(config, Arc::new(NullSink)).await
    }

    /// Current transport state
    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Diagnostic snapshot of the session
    pub fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "host": self.config.host,
            "port": self.config.port,
            "state": self.connection_state().to_string(),
            "mode": self.config.mode.to_string(),
            "sample_frequency_hz": self.config.sample_frequency_hz,
            "collecting": self.collection.is_some(),
        })
    }

    /// Read a device register
    pub async fn read_register(&self, address: impl Into<u16>) -> Result<u32> {
        self.commands.read_register(address.into()).await
    }

    /// Write a device register
    pub async fn write_register(&self, address: impl Into<u16>, value: u32) -> Result<()> {
        self.commands.write_register(address.into(), value).await
    }

    /// Read and unpack the firmware version register
    pub async fn firmware_version(&self) -> Result<FirmwareVersion> {
        let raw = self.read_register(RegisterAddress::Version).await?;
        Ok(FirmwareVersion::from_raw(raw))
    }

    /// Select the telemetry representation on the device
    pub async fn set_run_mode(&self, mode: Mode) -> Result<()> {
        self.write_register(RegisterAddress::RunMode, mode.run_mode_value())
            .await
    }

    /// Inject one raw sample into the device ingest path (replay tool)
    pub async fn send_raw_sample(
        &self,
        accel_x: i16,
        accel_y: i16,
        accel_z: i16,
        counter: u16,
    ) -> Result<()> {
        self.commands
            .send_raw_sample(accel_x, accel_y, accel_z, counter)
            .await
    }

    /// Start collecting telemetry into the configured CSV file
    ///
    /// Spawns the collector and batch writer for the configured mode, then
    /// issues the start command. Returns the output path.
    pub async fn start_collection(&mut self) -> Result<PathBuf> {
        if self.collection.is_some() {
            return Err(LinkError::config("collection already running"));
        }
        let mode = self.config.mode;
        let telemetry_rx = match mode {
            Mode::Raw => self.telemetry_raw.take(),
            Mode::Derived => self.telemetry_derived.take(),
        }
        .ok_or_else(|| LinkError::config("telemetry channel already consumed"))?;

        let output_path = self.config.resolve_output_path();
        let (persist_tx, persist_rx) = mpsc::channel(self.config.persist_capacity);

        let collect_cancel = self.cancel.child_token();
        let collector = TelemetryCollector::new(
            mode,
            self.config.sample_period(),
            Arc::clone(&self.sink),
            persist_tx,
            self.config.queue_put_timeout(),
        );
        let collector_handle = tokio::spawn(collector.run(telemetry_rx, collect_cancel.clone()));

        let writer = BatchWriter::new(
            output_path.clone(),
            mode,
            self.config.writer_interval(),
            self.config.writer_drain_cap,
        );
        let writer_handle = tokio::spawn(writer.run(persist_rx));

        if let Err(e) = self.commands.start().await {
            collect_cancel.cancel();
            let _ = collector_handle.await;
            let _ = writer_handle.await;
            return Err(e);
        }
        info!("collection started ({} mode) -> {}", mode, output_path.display());

        self.collection = Some(Collection {
            cancel: collect_cancel,
            collector: collector_handle,
            writer: writer_handle,
            output_path: output_path.clone(),
        });
        Ok(output_path)
    }

    /// Stop collecting: quiesce the device, drain, then shut the tasks down
    ///
    /// The stop command result is returned after cleanup; a stop timeout
    /// still tears the session down so no partial CSV row is left behind.
    pub async fn stop_collection(&mut self) -> Result<PathBuf> {
        let collection = self
            .collection
            .take()
            .ok_or_else(|| LinkError::config("collection not running"))?;

        let stop_result = self.commands.stop().await;
        if let Err(e) = &stop_result {
            warn!("stop command failed: {}", e);
        }

        // Let frames already past the router reach the collector before the
        // loops observe the stop.
        tokio::time::sleep(self.config.stop_drain()).await;
        collection.cancel.cancel();

        if collection.collector.await.is_err() {
            warn!("collector task panicked");
        }
        // The collector exit drops the persistence sender; the writer
        // flushes its backlog and finishes on its own.
        if collection.writer.await.is_err() {
            warn!("writer task panicked");
        }
        info!("collection stopped -> {}", collection.output_path.display());

        stop_result.map(|_| collection.output_path)
    }

    /// Tear the whole session down
    ///
    /// Stops any running collection first, then cancels the engine loops.
    /// The socket closes once both transport halves are dropped.
    pub async fn shutdown(mut self) -> Result<()> {
        if self.collection.is_some() {
            if let Err(e) = self.stop_collection().await {
                warn!("stop during shutdown: {}", e);
            }
        }
        self.cancel.cancel();
        self.transport.mark_closed();
        info!("session closed");
        Ok(())
    }
}
