//! End-to-end session against an in-process mock device
//!
//! The mock speaks the device side of the protocol over a real TCP socket:
//! it acknowledges commands, answers register reads, and streams raw
//! telemetry frames after a start command.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gsensor_link::{ConnectionState, DeviceClient, LinkConfig, Mode, Sample, SampleSink};

const START_MARKER: u8 = 0x02;
const END_MARKER: u8 = 0x03;

const FIRMWARE_RAW: u32 = 0x0002_0103;
const STREAMED_FRAMES: usize = 100;

/// Build a device-side frame: length byte counts everything after itself
/// through the end marker.
fn device_frame(code: &[u8; 2], fields: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fields.len() + 5);
    out.push(START_MARKER);
    out.push((fields.len() + 4) as u8);
    out.extend_from_slice(code);
    out.extend_from_slice(fields);
    out.push(END_MARKER);
    out
}

fn raw_telemetry_frame(counter: u16) -> Vec<u8> {
    let mut fields = Vec::with_capacity(8);
    fields.extend(100i16.to_le_bytes());
    fields.extend((-50i16).to_le_bytes());
    fields.extend(16384i16.to_le_bytes());
    fields.extend(counter.to_le_bytes());
    device_frame(b"DA", &fields)
}

/// Serve one client connection: parse requests, acknowledge, stream
/// telemetry after start.
async fn serve(mut sock: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        // Requests carry no length byte; dispatch on the function code.
        loop {
            if buf.len() < 4 {
                break;
            }
            assert_eq!(buf[0], START_MARKER, "mock received malformed request");
            let code = [buf[1], buf[2]];
            let consumed = match &code {
                b"ST" => {
                    assert_eq!(buf[3], END_MARKER);
                    sock.write_all(&device_frame(b"ST", &[])).await.unwrap();
                    for counter in 0..STREAMED_FRAMES as u16 {
                        sock.write_all(&raw_telemetry_frame(counter)).await.unwrap();
                    }
                    4
                }
                b"ED" => {
                    assert_eq!(buf[3], END_MARKER);
                    sock.write_all(&device_frame(b"ED", &[])).await.unwrap();
                    4
                }
                b"RM" => {
                    if buf.len() < 6 {
                        break;
                    }
                    assert_eq!(buf[5], END_MARKER);
                    let addr = u16::from_le_bytes([buf[3], buf[4]]);
                    let value = if addr == 0 { FIRMWARE_RAW } else { 0 };
                    sock.write_all(&device_frame(b"MR", &value.to_le_bytes()))
                        .await
                        .unwrap();
                    6
                }
                b"WM" => {
                    if buf.len() < 10 {
                        break;
                    }
                    assert_eq!(buf[9], END_MARKER);
                    sock.write_all(&device_frame(b"MW", &[])).await.unwrap();
                    10
                }
                other => panic!("mock received unknown request code {:?}", other),
            };
            buf.drain(..consumed);
        }
    }
}

async fn spawn_mock_device() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        serve(sock).await;
    });
    port
}

#[derive(Default)]
struct RecordingSink {
    samples: Mutex<Vec<Sample>>,
}

impl SampleSink for RecordingSink {
    fn on_sample(&self, sample: &Sample) {
        self.samples.lock().unwrap().push(sample.clone());
    }
}

fn session_config(port: u16, output: std::path::PathBuf) -> LinkConfig {
    LinkConfig {
        host: "127.0.0.1".to_string(),
        port,
        mode: Mode::Raw,
        output_path: Some(output),
        writer_interval_ms: 10,
        stop_drain_ms: 100,
        ..LinkConfig::default()
    }
}

#[tokio::test]
async fn test_full_collection_session() {
    let port = spawn_mock_device().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("session").join("run.csv");
    let config = session_config(port, output.clone());

    let sink = Arc::new(RecordingSink::default());
    let mut client = DeviceClient::connect(config, sink.clone()).await.unwrap();
    assert!(client.connection_state().is_connected());

    let version = client.firmware_version().await.unwrap();
    assert_eq!((version.major, version.minor, version.test), (2, 1, 3));

    client.set_run_mode(Mode::Raw).await.unwrap();

    let path = client.start_collection().await.unwrap();
    assert_eq!(path, output);

    // Give the stream time to arrive and the writer a few wakes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.stop_collection().await.unwrap();

    // Every streamed frame reached the display sink, in order, with the
    // software sample clock advancing by the sample period.
    let samples = sink.samples.lock().unwrap();
    assert_eq!(samples.len(), STREAMED_FRAMES);
    match &samples[0] {
        Sample::Raw {
            timestamp,
            accel_x,
            accel_y,
            accel_z,
        } => {
            assert_eq!(*timestamp, 0.0);
            assert_eq!((*accel_x, *accel_y, *accel_z), (100, -50, 16384));
        }
        other => panic!("expected raw sample, got {:?}", other),
    }
    let expected_t1 = 1.0 / 2000.0;
    assert!((samples[1].timestamp() - expected_t1).abs() < 1e-12);
    drop(samples);

    // And the CSV holds a header plus one row per frame.
    let contents = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), STREAMED_FRAMES + 1);
    assert_eq!(lines[0], "Time,Accel_X,Accel_Y,Accel_Z");
    assert_eq!(lines[1], "0,100,-50,16384");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_register_round_trip_values() {
    let port = spawn_mock_device().await;
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(port, dir.path().join("unused.csv"));

    let client = DeviceClient::connect_headless(config).await.unwrap();
    assert_eq!(client.read_register(0u16).await.unwrap(), FIRMWARE_RAW);
    client.write_register(1u16, 1).await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peer_disconnect_faults_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
    });

    let dir = tempfile::tempdir().unwrap();
    let config = session_config(port, dir.path().join("unused.csv"));
    let client = DeviceClient::connect_headless(config).await.unwrap();

    // The reader observes the reset and faults the transport.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.connection_state(), ConnectionState::Faulted);

    // Commands now fail rather than hang forever.
    let err = client.read_register(0u16).await.unwrap_err();
    assert!(err.is_fatal() || matches!(err, gsensor_link::LinkError::CommandTimeout { .. }));
}