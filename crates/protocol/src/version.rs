//! AOA protocol version

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::aoa::PROTOCOL_VERSION_LEN;

/// Version reported by a device in response to `GET_PROTOCOL`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AccessoryProtocolVersion(pub u16);

impl AccessoryProtocolVersion {
    /// Decode the little-endian response buffer
    ///
    /// Returns `None` when the device sent fewer than two bytes.
    pub fn from_response(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PROTOCOL_VERSION_LEN {
            return None;
        }
        Some(Self(LittleEndian::read_u16(&bytes[..PROTOCOL_VERSION_LEN])))
    }

    /// Version 2 added audio output and HID event support
    pub fn supports_audio(&self) -> bool {
        self.0 >= 2
    }
}

impl fmt::Display for AccessoryProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AOA v{}", self.0)
    }
}
