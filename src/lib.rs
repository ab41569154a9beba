//! CRC-16 (poly 0x1021, init 0) checksums and checksummed framing for
//! BLE service links.

pub mod config;
pub mod protocol;
pub mod transport;
