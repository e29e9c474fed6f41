//! Command service
//!
//! Issues start/stop and register commands over the transport and
//! correlates replies off the shared acknowledgement channel. The wire
//! format carries no correlation identifier, so correctness rests on the
//! single-in-flight invariant: the ack receiver sits behind a mutex and the
//! guard serializes callers for the full request/ack exchange.

use std::time::Duration;

use bytes::Buf;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{LinkError, Result};
use crate::frame::{self, Frame, FunctionCode};
use crate::transport::TransportHandle;

pub struct CommandService {
    transport: TransportHandle,
    ack_rx: Mutex<mpsc::Receiver<Frame>>,
    ack_timeout: Duration,
}

impl CommandService {
    pub fn new(
        transport: TransportHandle,
        ack_rx: mpsc::Receiver<Frame>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            ack_rx: Mutex::new(ack_rx),
            ack_timeout,
        }
    }

    /// Begin telemetry streaming
    pub async fn start(&self) -> Result<()> {
        self.transact(frame::start_request(), FunctionCode::START)
            .await
            .map(|_| ())
    }

    /// End telemetry streaming
    pub async fn stop(&self) -> Result<()> {
        self.transact(frame::stop_request(), FunctionCode::STOP)
            .await
            .map(|_| ())
    }

    /// Write a device register
    pub async fn write_register(&self, address: u16, value: u32) -> Result<()> {
        debug!("write register {:#06X} = {:#010X}", address, value);
        self.transact(
            frame::write_register_request(address, value),
            FunctionCode::WRITE_REG_ACK,
        )
        .await
        .map(|_| ())
    }

    /// Read a device register
    pub async fn read_register(&self, address: u16) -> Result<u32> {
        debug!("read register {:#06X}", address);
        let ack = self
            .transact(
                frame::read_register_request(address),
                FunctionCode::READ_REG_ACK,
            )
            .await?;

        let mut payload = ack.payload();
        if payload.len() < 4 {
            return Err(LinkError::DecodeLength {
                function: FunctionCode::READ_REG_ACK,
                len: payload.len(),
            });
        }
        Ok(payload.get_u32_le())
    }

    /// Inject one raw accelerometer sample into the device ingest path
    ///
    /// Fire-and-forget: the device does not acknowledge telemetry frames.
    /// Used by the CSV replay tool.
    pub async fn send_raw_sample(
        &self,
        accel_x: i16,
        accel_y: i16,
        accel_z: i16,
        counter: u16,
    ) -> Result<()> {
        self.transport
            .enqueue_send(frame::raw_sample_frame(accel_x, accel_y, accel_z, counter))
            .await;
        Ok(())
    }

    /// Send a request and wait for its acknowledgement
    ///
    /// Failures return an indicator and are never retried here; retry
    /// policy belongs to the caller.
    async fn transact(&self, request: bytes::Bytes, expect: FunctionCode) -> Result<Frame> {
        let mut ack_rx = self.ack_rx.lock().await;

        // A previously timed-out command can leave its late ack queued;
        // discard anything stale so the next item correlates to us.
        while let Ok(stale) = ack_rx.try_recv() {
            warn!("discarding stale {} ack", stale.function_code());
        }

        self.transport.enqueue_send(request).await;

        let ack = match timeout(self.ack_timeout, ack_rx.recv()).await {
            Ok(Some(ack)) => ack,
            Ok(None) => return Err(LinkError::UpstreamClosed),
            Err(_) => {
                warn!("no {} ack within {:?}", expect, self.ack_timeout);
                return Err(LinkError::CommandTimeout { expected: expect });
            }
        };

        let actual = ack.function_code();
        if actual != expect {
            warn!("ack mismatch: expected {}, got {}", expect, actual);
            return Err(LinkError::CommandMismatch {
                expected: expect,
                actual,
            });
        }
        debug!("{} acknowledged", expect.description());
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_support::device_frame;
    use bytes::Bytes;
    use tokio_test::assert_ok;

    fn service(
        ack_capacity: usize,
        ack_timeout: Duration,
    ) -> (CommandService, mpsc::Receiver<Bytes>, mpsc::Sender<Frame>) {
        let (send_tx, send_rx) = mpsc::channel(16);
        let (ack_tx, ack_rx) = mpsc::channel(ack_capacity);
        let handle = TransportHandle::for_tests(send_tx, Duration::from_millis(100));
        (
            CommandService::new(handle, ack_rx, ack_timeout),
            send_rx,
            ack_tx,
        )
    }

    fn ack(code: FunctionCode, fields: &[u8]) -> Frame {
        Frame::new(Bytes::from(device_frame(code, fields)))
    }

    #[tokio::test]
    async fn test_write_register_round_trip() {
        let (service, mut wire, ack_tx) = service(4, Duration::from_millis(500));
        ack_tx.send(ack(FunctionCode::WRITE_REG_ACK, &[])).await.unwrap();

        service.write_register(0x0100, 0xDEAD_BEEF).await.unwrap();

        let sent = wire.recv().await.unwrap();
        assert_eq!(
            sent.as_ref(),
            &[0x02, b'W', b'M', 0x00, 0x01, 0xEF, 0xBE, 0xAD, 0xDE, 0x03]
        );
    }

    #[tokio::test]
    async fn test_write_register_wrong_ack_is_mismatch() {
        let (service, _wire, ack_tx) = service(4, Duration::from_millis(500));
        ack_tx.send(ack(FunctionCode::READ_REG_ACK, &[0; 4])).await.unwrap();

        let err = service.write_register(0x0100, 0xDEAD_BEEF).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::CommandMismatch {
                expected: FunctionCode::WRITE_REG_ACK,
                actual: FunctionCode::READ_REG_ACK,
            }
        ));
    }

    #[tokio::test]
    async fn test_read_register_returns_value() {
        let (service, mut wire, ack_tx) = service(4, Duration::from_millis(500));
        ack_tx
            .send(ack(FunctionCode::READ_REG_ACK, &0xCAFE_F00Du32.to_le_bytes()))
            .await
            .unwrap();

        let value = service.read_register(0x0005).await.unwrap();
        assert_eq!(value, 0xCAFE_F00D);

        let sent = wire.recv().await.unwrap();
        assert_eq!(sent.as_ref(), &[0x02, b'R', b'M', 0x05, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn test_read_register_short_payload_rejected() {
        let (service, _wire, ack_tx) = service(4, Duration::from_millis(500));
        ack_tx
            .send(ack(FunctionCode::READ_REG_ACK, &[0xAA, 0xBB]))
            .await
            .unwrap();

        let err = service.read_register(0).await.unwrap_err();
        assert!(matches!(err, LinkError::DecodeLength { .. }));
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let (service, _wire, _ack_tx) = service(4, Duration::from_millis(20));
        let err = service.start().await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::CommandTimeout {
                expected: FunctionCode::START
            }
        ));
    }

    #[tokio::test]
    async fn test_start_stop_echo_validation() {
        let (service, _wire, ack_tx) = service(4, Duration::from_millis(500));

        ack_tx.send(ack(FunctionCode::START, &[])).await.unwrap();
        tokio_test::assert_ok!(service.start().await);

        ack_tx.send(ack(FunctionCode::STOP, &[])).await.unwrap();
        tokio_test::assert_ok!(service.stop().await);
    }

    #[tokio::test]
    async fn test_stale_ack_is_discarded_before_send() {
        let (service, _wire, ack_tx) = service(4, Duration::from_millis(500));

        // A late ack from an earlier timed-out command sits in the queue;
        // the genuine echo arrives only after the request goes out.
        ack_tx.send(ack(FunctionCode::READ_REG_ACK, &[0; 4])).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ack_tx.send(ack(FunctionCode::START, &[])).await.unwrap();
        });

        // start() must not correlate against the stale read ack.
        service.start().await.unwrap();
    }
}
