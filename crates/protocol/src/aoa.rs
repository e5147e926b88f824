//! Android Open Accessory control requests
//!
//! The AOA handshake is three vendor-class control requests on endpoint 0:
//!
//! | bRequest | Direction | wValue | wIndex | Data |
//! |---|---|---|---|---|
//! | 51 `GET_PROTOCOL` | IN | 0 | 0 | 2 bytes, little-endian version |
//! | 52 `SEND_STRING` | OUT | 0 | slot 0-5 | ASCII + NUL |
//! | 53 `START` | OUT | 0 | 0 | none |

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

pub const USB_DIR_OUT: u8 = 0x00;
pub const USB_DIR_IN: u8 = 0x80;
pub const USB_TYPE_VENDOR: u8 = 0x40;

/// Query the AOA protocol version
pub const ACCESSORY_GET_PROTOCOL: u8 = 51;
/// Send one identification string
pub const ACCESSORY_SEND_STRING: u8 = 52;
/// Re-enumerate in accessory mode
pub const ACCESSORY_START: u8 = 53;

pub const VENDOR_ID_GOOGLE: u16 = 0x18d1;
pub const VENDOR_ID_SAMSUNG: u16 = 0x04e8;
pub const PRODUCT_ID_SAMSUNG: u16 = 0x6860;

/// Accessory mode
pub const PRODUCT_ID_ACCESSORY: u16 = 0x2d00;
/// Accessory mode with ADB
pub const PRODUCT_ID_ACCESSORY_ADB: u16 = 0x2d01;

/// Every product ID a Google-VID device may enumerate with once in accessory mode
/// (accessory, +adb, audio, audio+adb, accessory+audio, accessory+audio+adb)
pub const ACCESSORY_PRODUCT_IDS: [u16; 6] = [0x2d00, 0x2d01, 0x2d02, 0x2d03, 0x2d04, 0x2d05];

/// Length of the GET_PROTOCOL response
pub const PROTOCOL_VERSION_LEN: usize = 2;

/// Largest payload a single control transfer can carry (wLength is 16 bits)
pub const MAX_CONTROL_PAYLOAD: usize = u16::MAX as usize;

/// Setup packet fields of a control transfer (wLength comes from the data buffer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    pub fn is_in(&self) -> bool {
        self.request_type & USB_DIR_IN == USB_DIR_IN
    }

    /// `GET_PROTOCOL`: vendor IN, expects a two byte response
    pub const fn get_protocol() -> Self {
        Self {
            request_type: USB_DIR_IN | USB_TYPE_VENDOR,
            request: ACCESSORY_GET_PROTOCOL,
            value: 0,
            index: 0,
        }
    }

    /// `SEND_STRING` for one identification slot
    pub const fn send_string(slot: AccessoryString) -> Self {
        Self {
            request_type: USB_DIR_OUT | USB_TYPE_VENDOR,
            request: ACCESSORY_SEND_STRING,
            value: 0,
            index: slot as u16,
        }
    }

    /// `START`: vendor OUT, no payload
    pub const fn start_accessory() -> Self {
        Self {
            request_type: USB_DIR_OUT | USB_TYPE_VENDOR,
            request: ACCESSORY_START,
            value: 0,
            index: 0,
        }
    }
}

/// Identification string slots, in the order they are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AccessoryString {
    Manufacturer = 0,
    Model = 1,
    Description = 2,
    Version = 3,
    Uri = 4,
    Serial = 5,
}

impl AccessoryString {
    pub const ALL: [AccessoryString; 6] = [
        AccessoryString::Manufacturer,
        AccessoryString::Model,
        AccessoryString::Description,
        AccessoryString::Version,
        AccessoryString::Uri,
        AccessoryString::Serial,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AccessoryString::Manufacturer => "manufacturer",
            AccessoryString::Model => "model",
            AccessoryString::Description => "description",
            AccessoryString::Version => "version",
            AccessoryString::Uri => "uri",
            AccessoryString::Serial => "serial",
        }
    }
}

impl TryFrom<u16> for AccessoryString {
    type Error = ProtocolError;

    fn try_from(index: u16) -> Result<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or(ProtocolError::UnknownSlot(index))
    }
}

/// The six strings the host announces to the device
///
/// The Android side uses manufacturer/model/version to pick the app that
/// handles the accessory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryStrings {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub uri: String,
    pub serial: String,
}

impl Default for AccessoryStrings {
    fn default() -> Self {
        Self {
            manufacturer: "ReyRey".to_string(),
            model: "Galaxy Scanner".to_string(),
            description: "Galaxy Scanner Desc".to_string(),
            version: "1.0.0".to_string(),
            uri: "https://github.com/mystborn".to_string(),
            serial: "12345".to_string(),
        }
    }
}

impl AccessoryStrings {
    pub fn get(&self, slot: AccessoryString) -> &str {
        match slot {
            AccessoryString::Manufacturer => &self.manufacturer,
            AccessoryString::Model => &self.model,
            AccessoryString::Description => &self.description,
            AccessoryString::Version => &self.version,
            AccessoryString::Uri => &self.uri,
            AccessoryString::Serial => &self.serial,
        }
    }

    /// Check every string encodes cleanly
    pub fn validate(&self) -> Result<()> {
        for slot in AccessoryString::ALL {
            encode_string(slot, self.get(slot))?;
        }
        Ok(())
    }

    /// Encode all six strings in slot order
    pub fn encode_all(&self) -> Result<Vec<(AccessoryString, Vec<u8>)>> {
        AccessoryString::ALL
            .into_iter()
            .map(|slot| Ok((slot, encode_string(slot, self.get(slot))?)))
            .collect()
    }
}

/// Encode an identification string as strict ASCII followed by a single NUL
pub fn encode_string(slot: AccessoryString, value: &str) -> Result<Vec<u8>> {
    if !value.is_ascii() {
        return Err(ProtocolError::NonAscii {
            slot: slot.name(),
            value: value.to_string(),
        });
    }
    if value.bytes().any(|b| b == 0) {
        return Err(ProtocolError::InteriorNul { slot: slot.name() });
    }

    let len = value.len() + 1;
    if len > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::StringTooLong {
            slot: slot.name(),
            len,
            max: MAX_CONTROL_PAYLOAD,
        });
    }

    let mut bytes = Vec::with_capacity(len);
    bytes.extend_from_slice(value.as_bytes());
    bytes.push(0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packets() {
        let get = ControlSetup::get_protocol();
        assert_eq!(get.request_type, 0xc0);
        assert_eq!(get.request, 51);
        assert!(get.is_in());

        let send = ControlSetup::send_string(AccessoryString::Uri);
        assert_eq!(send.request_type, 0x40);
        assert_eq!(send.request, 52);
        assert_eq!(send.index, 4);
        assert!(!send.is_in());

        let start = ControlSetup::start_accessory();
        assert_eq!(start.request, 53);
        assert_eq!(start.index, 0);
        assert_eq!(start.value, 0);
    }

    #[test]
    fn test_encode_string_appends_single_nul() {
        let bytes = encode_string(AccessoryString::Version, "1.0.0").unwrap();
        assert_eq!(bytes, b"1.0.0\0");

        let empty = encode_string(AccessoryString::Serial, "").unwrap();
        assert_eq!(empty, vec![0]);
    }

    #[test]
    fn test_encode_string_rejects_non_ascii() {
        let err = encode_string(AccessoryString::Model, "Galaxy Scänner").unwrap_err();
        assert!(matches!(err, ProtocolError::NonAscii { slot: "model", .. }));

        let err = encode_string(AccessoryString::Model, "a\0b").unwrap_err();
        assert_eq!(err, ProtocolError::InteriorNul { slot: "model" });
    }

    #[test]
    fn test_slot_order() {
        let indices: Vec<u16> = AccessoryString::ALL.iter().map(|s| *s as u16).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(AccessoryString::try_from(2).unwrap(), AccessoryString::Description);
        assert_eq!(
            AccessoryString::try_from(6).unwrap_err(),
            ProtocolError::UnknownSlot(6)
        );
    }

    #[test]
    fn test_default_strings_encode_in_order() {
        let strings = AccessoryStrings::default();
        strings.validate().unwrap();

        let encoded = strings.encode_all().unwrap();
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], (AccessoryString::Manufacturer, b"ReyRey\0".to_vec()));
        assert_eq!(encoded[5], (AccessoryString::Serial, b"12345\0".to_vec()));
    }
}
