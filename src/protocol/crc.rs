use crc::{Crc, Digest, CRC_16_XMODEM};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generator polynomial x^16 + x^12 + x^5 + 1.
pub const POLY: u16 = 0x1021;

/// Table-driven form of the same algorithm (poly 0x1021, init 0, no reflect, no xorout).
static CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrcError {
    #[error("invalid input: element {index} has value {value}, not a byte")]
    InvalidInput { index: usize, value: u32 },
    #[error("data too short for a checksum trailer: {len} bytes")]
    TooShort { len: usize },
    #[error("checksum mismatch: received 0x{expected:04X}, computed 0x{computed:04X}")]
    Mismatch { expected: u16, computed: u16 },
}

/// Order of the two checksum bytes on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    pub fn to_bytes(self, crc: u16) -> [u8; 2] {
        match self {
            ByteOrder::Big => crc.to_be_bytes(),
            ByteOrder::Little => crc.to_le_bytes(),
        }
    }

    pub fn read(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Big => u16::from_be_bytes(bytes),
            ByteOrder::Little => u16::from_le_bytes(bytes),
        }
    }
}

/// CRC-16 over `data`: poly 0x1021, init 0x0000, MSB first, no reflection, no final XOR.
pub fn checksum(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Like [`checksum`], for callers holding wider integers.
/// Fails on the first element that does not fit in a byte.
pub fn checksum_checked(data: &[u32]) -> Result<u16, CrcError> {
    let mut digest = Crc16::new();
    for (index, &value) in data.iter().enumerate() {
        let byte = u8::try_from(value).map_err(|_| CrcError::InvalidInput { index, value })?;
        digest.update(&[byte]);
    }
    Ok(digest.finalize())
}

/// Incremental checksum. Feeding `a` then `b` yields `checksum(a ++ b)`.
pub struct Crc16 {
    digest: Digest<'static, u16>,
}

impl Crc16 {
    pub fn new() -> Self {
        Self {
            digest: CRC.digest(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> u16 {
        self.digest.finalize()
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy `payload` and append its checksum in `order`.
pub fn append_checksum(payload: &[u8], order: ByteOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(payload);
    out.extend_from_slice(&order.to_bytes(checksum(payload)));
    out
}

/// Check a payload followed by a two byte trailer. Returns the payload on success.
pub fn verify_checksum(data: &[u8], order: ByteOrder) -> Result<&[u8], CrcError> {
    if data.len() < 2 {
        return Err(CrcError::TooShort { len: data.len() });
    }
    let (payload, trailer) = data.split_at(data.len() - 2);
    let expected = order.read([trailer[0], trailer[1]]);
    let computed = checksum(payload);
    if expected != computed {
        return Err(CrcError::Mismatch { expected, computed });
    }
    Ok(payload)
}
