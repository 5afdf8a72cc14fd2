//! Binary protocol spoken between [`ExternalWorldStateDb`](crate::ExternalWorldStateDb)
//! and a world state process over its stdin / stdout.
//!
//! All integers are big-endian `u32`.
//!
//! | Direction | Frame |
//! |---|---|
//! | child → parent, once at start | `root (32) ‖ size ‖ depth` |
//! | `GET` request | `0x00 ‖ index` |
//! | `GET` reply | `len ‖ value` (`len == 0`: never written) |
//! | `PUT` request | `0x01 ‖ index ‖ len ‖ value` |
//! | `PUT` reply | `root (32)` |
//! | `GET_HASH_PATH` request | `0x02 ‖ index` |
//! | `GET_HASH_PATH` reply | `depth ‖ depth × 64 bytes` |

/// Largest value accepted by `PUT`
pub const MAX_VALUE_BYTES: u32 = 1 << 20;

/// Request opcode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Read a leaf value
    Get = 0,
    /// Write a leaf value
    Put = 1,
    /// Read a hash path
    GetHashPath = 2,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(Self::Get),
            1 => Ok(Self::Put),
            2 => Ok(Self::GetHashPath),
            other => Err(other),
        }
    }
}

/// Encode a request header: opcode and index
pub fn request(command: Command, index: u32) -> [u8; 5] {
    let mut frame = [0u8; 5];
    frame[0] = command as u8;
    frame[1..].copy_from_slice(&index.to_be_bytes());
    frame
}
