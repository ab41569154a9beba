pub mod crc;
pub mod frame;
pub mod hex;

pub use self::crc::{checksum, ByteOrder};
pub use frame::{Frame, FrameCodec, FrameError};
