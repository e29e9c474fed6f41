//! Wire frame model and request builders
//!
//! Every protocol message is delimited by a fixed start marker, a length
//! byte, a two-letter ASCII function code, a payload, and a fixed end
//! marker. Command requests are built here; inbound frames are produced by
//! the decoder and consumed whole by the router.

use bytes::{BufMut, Bytes, BytesMut};

/// Frame start delimiter
pub const START_MARKER: u8 = 0x02;
/// Frame end delimiter
pub const END_MARKER: u8 = 0x03;

/// Smallest length byte a real frame can carry (function code + end marker)
pub const MIN_LEN_BYTE: u8 = 4;

/// Two-byte ASCII function code
///
/// The pair is written to the wire in ASCII order, which is the big-endian
/// byte order of the combined u16. Register acks come back with the letter
/// order swapped relative to the request (`WM` request, `MW` ack), a
/// firmware quirk that must be preserved for interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionCode(pub [u8; 2]);

impl FunctionCode {
    /// Start streaming request; ack echoes the same pair
    pub const START: Self = Self(*b"ST");
    /// Stop streaming request; ack echoes the same pair
    pub const STOP: Self = Self(*b"ED");
    /// Write-register request
    pub const WRITE_REG: Self = Self(*b"WM");
    /// Write-register acknowledgement
    pub const WRITE_REG_ACK: Self = Self(*b"MW");
    /// Read-register request
    pub const READ_REG: Self = Self(*b"RM");
    /// Read-register acknowledgement (carries the 4-byte value)
    pub const READ_REG_ACK: Self = Self(*b"MR");
    /// Raw accelerometer telemetry
    pub const TELEMETRY_RAW: Self = Self(*b"DA");
    /// Derived (scale / AC-coupled / envelope) telemetry
    pub const TELEMETRY_DERIVED: Self = Self(*b"AA");
    /// Event text from the device
    pub const EVENT: Self = Self(*b"EV");

    /// Combined big-endian value, useful for logging
    pub fn as_u16(self) -> u16 {
        u16::from_be_bytes(self.0)
    }

    /// Human-readable purpose of the code
    pub fn description(self) -> &'static str {
        match self {
            Self::START => "start",
            Self::STOP => "stop",
            Self::WRITE_REG => "write-register",
            Self::WRITE_REG_ACK => "write-register-ack",
            Self::READ_REG => "read-register",
            Self::READ_REG_ACK => "read-register-ack",
            Self::TELEMETRY_RAW => "telemetry-raw",
            Self::TELEMETRY_DERIVED => "telemetry-derived",
            Self::EVENT => "event",
            _ => "unknown",
        }
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_uppercase()) {
            write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
        } else {
            write!(f, "{:04X}", self.as_u16())
        }
    }
}

/// One complete, validated protocol message
///
/// Holds the full delimited byte span as produced by the decoder. Immutable
/// after construction; routed whole to exactly one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Wrap a validated span. Only the decoder (and tests) build frames.
    pub(crate) fn new(bytes: Bytes) -> Self {
        debug_assert!(bytes.len() >= MIN_LEN_BYTE as usize + 1);
        debug_assert_eq!(bytes[0], START_MARKER);
        debug_assert_eq!(bytes[bytes.len() - 1], END_MARKER);
        Self { bytes }
    }

    /// The raw length byte
    pub fn len_byte(&self) -> u8 {
        self.bytes[1]
    }

    /// Function code of this frame
    pub fn function_code(&self) -> FunctionCode {
        FunctionCode([self.bytes[2], self.bytes[3]])
    }

    /// Payload span between the function code and the expected end position
    ///
    /// Always `len_byte - 3` bytes, independent of whether the end marker
    /// landed at its nominal position or one byte late. The final byte
    /// mirrors the end-marker slot, which is why the telemetry layouts count
    /// one byte past their last field.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[4..self.len_byte() as usize + 1]
    }

    /// Full delimited span, start marker through end marker
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Format bytes as a spaced hex string for trace logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Request builders
// ============================================================================
//
// Command requests carry no length byte; the device acks do. Function code
// bytes go out in ASCII order, address and data fields little-endian.

/// `start()` request bytes
pub fn start_request() -> Bytes {
    bare_request(FunctionCode::START)
}

/// `stop()` request bytes
pub fn stop_request() -> Bytes {
    bare_request(FunctionCode::STOP)
}

fn bare_request(code: FunctionCode) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(START_MARKER);
    buf.put_slice(&code.0);
    buf.put_u8(END_MARKER);
    buf.freeze()
}

/// Write-register request: address and value little-endian
pub fn write_register_request(address: u16, value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(START_MARKER);
    buf.put_slice(&FunctionCode::WRITE_REG.0);
    buf.put_u16_le(address);
    buf.put_u32_le(value);
    buf.put_u8(END_MARKER);
    buf.freeze()
}

/// Read-register request: address little-endian
pub fn read_register_request(address: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(START_MARKER);
    buf.put_slice(&FunctionCode::READ_REG.0);
    buf.put_u16_le(address);
    buf.put_u8(END_MARKER);
    buf.freeze()
}

/// Raw accelerometer sample frame, used by the CSV replay tool to feed the
/// device's ingest path
pub fn raw_sample_frame(accel_x: i16, accel_y: i16, accel_z: i16, counter: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(START_MARKER);
    buf.put_slice(&FunctionCode::TELEMETRY_RAW.0);
    buf.put_i16_le(accel_x);
    buf.put_i16_le(accel_y);
    buf.put_i16_le(accel_z);
    buf.put_u16_le(counter);
    buf.put_u8(END_MARKER);
    buf.freeze()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a well-formed device frame: the length byte counts everything
    /// after itself through the end marker, so the end marker sits at offset
    /// `LEN` from the start marker.
    pub fn device_frame(code: FunctionCode, fields: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(fields.len() + 5);
        out.push(START_MARKER);
        out.push((fields.len() + 4) as u8);
        out.extend_from_slice(&code.0);
        out.extend_from_slice(fields);
        out.push(END_MARKER);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_request_bytes() {
        assert_eq!(start_request().as_ref(), &[0x02, b'S', b'T', 0x03]);
        assert_eq!(stop_request().as_ref(), &[0x02, b'E', b'D', 0x03]);
    }

    #[test]
    fn test_write_register_request_bytes() {
        // Address and value fields little-endian, function code in ASCII order
        let req = write_register_request(0x0100, 0xDEAD_BEEF);
        assert_eq!(
            req.as_ref(),
            &[0x02, b'W', b'M', 0x00, 0x01, 0xEF, 0xBE, 0xAD, 0xDE, 0x03]
        );
    }

    #[test]
    fn test_read_register_request_bytes() {
        let req = read_register_request(0x0005);
        assert_eq!(req.as_ref(), &[0x02, b'R', b'M', 0x05, 0x00, 0x03]);
    }

    #[test]
    fn test_raw_sample_frame_bytes() {
        let frame = raw_sample_frame(100, -50, 16384, 7);
        assert_eq!(
            frame.as_ref(),
            &[
                0x02, b'D', b'A', 0x64, 0x00, 0xCE, 0xFF, 0x00, 0x40, 0x07, 0x00, 0x03
            ]
        );
    }

    #[test]
    fn test_frame_accessors() {
        let raw = test_support::device_frame(FunctionCode::TELEMETRY_RAW, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let frame = Frame::new(Bytes::from(raw));
        assert_eq!(frame.len_byte(), 12);
        assert_eq!(frame.function_code(), FunctionCode::TELEMETRY_RAW);
        // Payload runs through the end-marker slot: 8 field bytes + 1
        assert_eq!(frame.payload().len(), 9);
        assert_eq!(&frame.payload()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_function_code_display() {
        assert_eq!(FunctionCode::START.to_string(), "ST");
        assert_eq!(FunctionCode::WRITE_REG_ACK.to_string(), "MW");
        assert_eq!(FunctionCode([0x01, 0x02]).to_string(), "0102");
    }

    #[test]
    fn test_function_code_as_u16_is_big_endian() {
        assert_eq!(
            FunctionCode::START.as_u16(),
            ((b'S' as u16) << 8) | b'T' as u16
        );
    }
}
