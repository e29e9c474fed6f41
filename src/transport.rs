//! TCP transport layer
//!
//! Owns the socket exclusively. Two independent loops run on top of the
//! split stream: a reader that pushes raw chunks into the byte pipe, and a
//! writer that coalesces queued outbound buffers into fewer `send` calls.
//! No other component ever touches the socket; commands and telemetry both
//! go through the queues owned here.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::frame::hex_dump;

/// Size of the socket receive buffer
const RECV_BUFFER_LEN: usize = 4096;

/// Connection state for a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection yet
    #[default]
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Socket established
    Connected,
    /// Closed on request
    Closed,
    /// Unrecoverable socket error
    Faulted,
}

impl ConnectionState {
    /// Check if state represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the session ended abnormally
    pub fn is_faulted(&self) -> bool {
        matches!(self, ConnectionState::Faulted)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Faulted => write!(f, "FAULTED"),
        }
    }
}

fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let prev = state.send_replace(next);
    if prev != next {
        info!("connection state {} -> {}", prev, next);
    }
}

/// Mark the session closed unless it already faulted
fn close_unless_faulted(state: &watch::Sender<ConnectionState>) {
    if !state.borrow().is_faulted() {
        transition(state, ConnectionState::Closed);
    }
}

/// Cloneable handle for enqueueing outbound bytes
///
/// Send is best-effort: a bounded wait, then the buffer is dropped and
/// logged. Retry policy belongs to callers that care.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    send_tx: mpsc::Sender<Bytes>,
    put_timeout: Duration,
}

impl TransportHandle {
    #[cfg(test)]
    pub(crate) fn for_tests(send_tx: mpsc::Sender<Bytes>, put_timeout: Duration) -> Self {
        Self {
            send_tx,
            put_timeout,
        }
    }

    pub async fn enqueue_send(&self, data: Bytes) {
        trace!("TX queue: {}", hex_dump(&data));
        match self.send_tx.send_timeout(data, self.put_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(data)) => {
                warn!("send queue full, dropped {} outbound byte(s)", data.len());
            }
            Err(SendTimeoutError::Closed(data)) => {
                debug!("send queue closed, dropped {} outbound byte(s)", data.len());
            }
        }
    }
}

/// One TCP session to the device
pub struct Transport {
    handle: TransportHandle,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Transport {
    /// Connect and spawn the reader/writer loops
    ///
    /// Returns the transport plus the receiver end of the byte pipe the
    /// reader fills; the decoder consumes it.
    pub async fn connect(
        config: &LinkConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<Bytes>)> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let state_tx = Arc::new(state_tx);

        let addr = format!("{}:{}", config.host, config.port);
        transition(&state_tx, ConnectionState::Connecting);
        debug!("TCP connecting: {}", addr);

        let stream = match timeout(config.connect_timeout(), TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!("TCP connected: {}", addr);
                stream
            }
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                transition(&state_tx, ConnectionState::Disconnected);
                return Err(LinkError::Connection(format!(
                    "Failed to connect to {addr}: {e}"
                )));
            }
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                transition(&state_tx, ConnectionState::Disconnected);
                return Err(LinkError::ConnectTimeout(format!(
                    "Connection to {addr} timed out"
                )));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }
        transition(&state_tx, ConnectionState::Connected);

        let (read_half, write_half) = stream.into_split();
        let (byte_tx, byte_rx) = mpsc::channel(config.channel_capacity);
        let (send_tx, send_rx) = mpsc::channel(config.channel_capacity);

        tokio::spawn(reader_loop(
            read_half,
            byte_tx,
            Arc::clone(&state_tx),
            config.queue_put_timeout(),
            cancel.clone(),
        ));
        tokio::spawn(writer_loop(
            write_half,
            send_rx,
            Arc::clone(&state_tx),
            config.send_window(),
            config.send_byte_cap,
            cancel,
        ));

        let transport = Self {
            handle: TransportHandle {
                send_tx,
                put_timeout: config.queue_put_timeout(),
            },
            state_tx,
            state_rx,
        };
        Ok((transport, byte_rx))
    }

    /// Handle for outbound sends
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Enqueue outbound bytes (best-effort, bounded wait)
    pub async fn enqueue_send(&self, data: Bytes) {
        self.handle.enqueue_send(data).await;
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch receiver for state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Mark the session closed (called after the loops observed the stop)
    pub fn mark_closed(&self) {
        close_unless_faulted(&self.state_tx);
    }
}

/// Blocking receive into a fixed buffer; every chunk, even a short read,
/// goes to the byte pipe. Zero-length read or socket error faults the
/// session and ends the loop.
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    byte_tx: mpsc::Sender<Bytes>,
    state: Arc<watch::Sender<ConnectionState>>,
    put_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reader loop cancelled");
                close_unless_faulted(&state);
                return;
            }
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    warn!("peer closed the connection");
                    transition(&state, ConnectionState::Faulted);
                    return;
                }
                Ok(n) => {
                    trace!("RX: {}B", n);
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    match byte_tx.send_timeout(chunk, put_timeout).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(chunk)) => {
                            warn!("byte pipe full, dropped {} received byte(s)", chunk.len());
                        }
                        Err(SendTimeoutError::Closed(_)) => {
                            debug!("byte pipe closed, reader exiting");
                            close_unless_faulted(&state);
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("socket read error: {}", e);
                    transition(&state, ConnectionState::Faulted);
                    return;
                }
            }
        }
    }
}

/// Collect outbound buffers arriving within a short window, bounded by
/// elapsed time and accumulated bytes, and flush them in one write. This
/// amortizes syscall overhead for bursty small commands.
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut send_rx: mpsc::Receiver<Bytes>,
    state: Arc<watch::Sender<ConnectionState>>,
    window: Duration,
    byte_cap: usize,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("writer loop cancelled");
                close_unless_faulted(&state);
                return;
            }
            item = send_rx.recv() => match item {
                Some(data) => data,
                None => {
                    debug!("send queue closed, writer exiting");
                    return;
                }
            }
        };

        let mut batch = BytesMut::from(&first[..]);
        let deadline = Instant::now() + window;
        while batch.len() < byte_cap {
            match timeout_at(deadline, send_rx.recv()).await {
                Ok(Some(data)) => batch.extend_from_slice(&data),
                Ok(None) => break,
                Err(_) => break, // window elapsed
            }
        }

        if let Err(e) = write_half.write_all(&batch).await {
            error!("socket write error: {}", e);
            transition(&state, ConnectionState::Faulted);
            return;
        }
        trace!("TX: {}B: {}", batch.len(), hex_dump(&batch));
    }
}
