//! Resynchronizing frame decoder
//!
//! Turns the arbitrarily-chunked byte stream from the transport into
//! discrete validated frames. Bytes that cannot belong to a frame are
//! dropped from the data stream but surfaced in the log as framing
//! anomalies; a partial frame tail is retained until more bytes arrive.

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{LinkError, Result};
use crate::frame::{hex_dump, Frame, END_MARKER, MIN_LEN_BYTE, START_MARKER};
use crate::router::FrameRouter;
use crate::transport::ConnectionState;

/// Incremental frame scanner over an accumulation buffer
///
/// The scan never consumes a byte until its status is decided: either it is
/// part of an emitted frame, or it is provably noise. A start marker whose
/// candidate span runs past the buffered data is kept for the next chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every frame that is now complete
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Bytes currently retained waiting for more data
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total noise bytes dropped during resynchronization
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Scan from the buffer head for the next complete frame
    ///
    /// The end marker is expected at offset `LEN` from the start marker, or
    /// at `LEN+1` (observed firmware miscount). If neither position holds
    /// the marker, the start byte was a false positive and scanning resumes
    /// one byte later.
    fn next_frame(&mut self) -> Option<Frame> {
        let mut skip = 0usize;
        loop {
            let len = self.buf.len();
            if skip >= len {
                self.drop_noise(skip);
                return None;
            }
            if self.buf[skip] != START_MARKER {
                skip += 1;
                continue;
            }
            if skip + 1 >= len {
                // start marker found but no length byte yet
                self.drop_noise(skip);
                return None;
            }
            let len_byte = self.buf[skip + 1] as usize;
            if len_byte < MIN_LEN_BYTE as usize {
                skip += 1;
                continue;
            }
            let Some(&primary) = self.buf.get(skip + len_byte) else {
                self.drop_noise(skip);
                return None;
            };
            let end_pos = if primary == END_MARKER {
                skip + len_byte
            } else {
                match self.buf.get(skip + len_byte + 1) {
                    None => {
                        self.drop_noise(skip);
                        return None;
                    }
                    Some(&b) if b == END_MARKER => skip + len_byte + 1,
                    Some(_) => {
                        skip += 1;
                        continue;
                    }
                }
            };
            self.drop_noise(skip);
            let span = self.buf.split_to(end_pos - skip + 1).freeze();
            trace!("frame: {}", hex_dump(&span));
            return Some(Frame::new(span));
        }
    }

    fn drop_noise(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let noise = self.buf.split_to(count);
        self.discarded += count as u64;
        warn!(
            "framing anomaly: dropped {} byte(s) before frame start: {}",
            count,
            hex_dump(&noise)
        );
    }
}

/// Pull chunks off the byte pipe, decode, and hand frames to the router
///
/// Returns `UpstreamClosed` when the pipe is exhausted while the transport
/// sits in the faulted state; a pipe closed after a clean shutdown ends the
/// loop quietly.
pub async fn decode_loop(
    mut byte_rx: mpsc::Receiver<Bytes>,
    router: FrameRouter,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("decode loop cancelled, {} byte(s) pending", decoder.pending());
                return Ok(());
            }
            chunk = byte_rx.recv() => match chunk {
                Some(chunk) => {
                    for frame in decoder.push_chunk(&chunk) {
                        router.route(frame).await;
                    }
                }
                None => {
                    if *state.borrow() == ConnectionState::Faulted {
                        return Err(LinkError::UpstreamClosed);
                    }
                    debug!("byte pipe closed");
                    return Ok(());
                }
            }
        }
    }
}
