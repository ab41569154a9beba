use thiserror::Error;

use super::crc::{append_checksum, verify_checksum, ByteOrder, CrcError};
use super::hex;

/// Default start-of-frame byte.
pub const MAGIC: u8 = 0x5A;

/// Largest payload accepted unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid magic byte: 0x{0:02X}")]
    BadMagic(u8),
    #[error("length field says {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Checksum(#[from] CrcError),
}

/// A framed payload.
///
/// Wire format:
/// ```text
/// [magic] [length: 2 bytes BE] [payload: length bytes] [CRC16: 2 bytes]
/// ```
///
/// The checksum covers everything before it; its byte order is set by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "len={} payload={}",
            self.payload.len(),
            hex::encode(&self.payload)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    pub magic: u8,
    pub order: ByteOrder,
    pub max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            order: ByteOrder::Big,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameCodec {
    pub const HEADER_LEN: usize = 3;
    pub const TRAILER_LEN: usize = 2;

    pub fn new(magic: u8, order: ByteOrder, max_payload: usize) -> Self {
        Self {
            magic,
            order,
            max_payload: max_payload.min(usize::from(u16::MAX)),
        }
    }

    /// Total wire size of a frame carrying `payload_len` bytes.
    pub fn frame_len(payload_len: usize) -> usize {
        Self::HEADER_LEN + payload_len + Self::TRAILER_LEN
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        let max = self.max_payload.min(usize::from(u16::MAX));
        if len > max {
            return Err(FrameError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    /// Serialize a frame for transmission.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let len = frame.payload.len();
        self.check_len(len)?;

        let mut body = Vec::with_capacity(Self::HEADER_LEN + len);
        body.push(self.magic);
        // check_len caps len at u16::MAX
        body.extend_from_slice(&(len as u16).to_be_bytes());
        body.extend_from_slice(&frame.payload);

        Ok(append_checksum(&body, self.order))
    }

    /// Parse and validate exactly one frame.
    pub fn decode(&self, data: &[u8]) -> Result<Frame, FrameError> {
        if data.len() < Self::frame_len(0) {
            return Err(FrameError::TooShort(data.len()));
        }
        if data[0] != self.magic {
            return Err(FrameError::BadMagic(data[0]));
        }

        let declared = self.declared_len([data[1], data[2]])?;
        let actual = data.len() - Self::frame_len(0);
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        let body = verify_checksum(data, self.order)?;
        Ok(Frame::new(&body[Self::HEADER_LEN..]))
    }

    /// Read the length field of a header and check it against the payload limit.
    pub fn declared_len(&self, field: [u8; 2]) -> Result<usize, FrameError> {
        let len = usize::from(u16::from_be_bytes(field));
        self.check_len(len)?;
        Ok(len)
    }
}
