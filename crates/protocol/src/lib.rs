//! Protocol library for aoa-echo
//!
//! This crate defines the Android Open Accessory (AOA) control requests and
//! the value types shared by the USB backend contract and the accessory engine.
//! It performs no I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{AccessoryString, AccessoryStrings, ControlSetup};
//!
//! let strings = AccessoryStrings::default();
//! for (slot, payload) in strings.encode_all().unwrap() {
//!     let setup = ControlSetup::send_string(slot);
//!     assert_eq!(setup.index, slot as u16);
//!     assert_eq!(payload.last(), Some(&0));
//! }
//! ```

pub mod aoa;
pub mod error;
pub mod types;
pub mod version;

pub use aoa::{
    ACCESSORY_GET_PROTOCOL, ACCESSORY_PRODUCT_IDS, ACCESSORY_SEND_STRING, ACCESSORY_START,
    AccessoryString, AccessoryStrings, ControlSetup, PRODUCT_ID_ACCESSORY,
    PRODUCT_ID_ACCESSORY_ADB, PRODUCT_ID_SAMSUNG, PROTOCOL_VERSION_LEN, VENDOR_ID_GOOGLE,
    VENDOR_ID_SAMSUNG, encode_string,
};
pub use error::{ProtocolError, Result};
pub use types::{
    DeviceClass, DeviceFilter, DeviceHandle, DeviceIdentity, ENDPOINT_DIRECTION_MASK,
    EndpointPair, PipeInfo, SessionState, TransferKind, UsbError,
};
pub use version::AccessoryProtocolVersion;
