//! USB and session type definitions
//!
//! This module defines the value types shared between the USB backend
//! contract and the accessory engine: device handles and identities,
//! hotplug filters, pipe descriptions, and per-device session state.

use crate::aoa::{ACCESSORY_PRODUCT_IDS, VENDOR_ID_GOOGLE};
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Device handle (attachment-specific)
///
/// Issued by the USB backend when a device arrives. A device that is
/// unplugged and plugged back in receives a new handle, so a handle never
/// outlives the attachment it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(pub u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a device's identity, captured when it connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Serial number string (if the device reports one)
    pub serial_number: Option<String>,
    /// Bus number on the host
    pub bus_number: u8,
    /// Backend-specific device path (e.g. "1-4.2" port chain)
    pub device_path: String,
}

impl DeviceIdentity {
    /// Serial number, or a placeholder for logging
    pub fn serial_or_unknown(&self) -> &str {
        self.serial_number.as_deref().unwrap_or("<no serial>")
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}/{:04x})",
            self.serial_or_unknown(),
            self.vendor_id,
            self.product_id
        )
    }
}

/// Hotplug filter on vendor/product identity
///
/// `None` in either half matches any value. The textual form is
/// `0xVID:0xPID`, with `*` as the wildcard (e.g. `0x18d1:*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Filter matching exactly one VID/PID pair
    pub const fn exact(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    /// Filter matching every product of a vendor
    pub const fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: None,
        }
    }

    /// Check if a VID/PID pair passes this filter
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    fn parse_half(filter: &str, part: &str, name: &str) -> Result<Option<u16>> {
        if part == "*" {
            return Ok(None);
        }

        let invalid = |reason: String| ProtocolError::InvalidFilter {
            filter: filter.to_string(),
            reason,
        };

        let hex = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| invalid(format!("{} '{}' must start with '0x'", name, part)))?;

        if hex.is_empty() || hex.len() > 4 {
            return Err(invalid(format!("{} '{}' must have 1-4 hex digits", name, part)));
        }

        u16::from_str_radix(hex, 16)
            .map(Some)
            .map_err(|_| invalid(format!("{} '{}' is not a valid hex number", name, part)))
    }
}

impl FromStr for DeviceFilter {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(ProtocolError::InvalidFilter {
                filter: s.to_string(),
                reason: "expected VID:PID (e.g. '0x04e8:0x6860' or '0x18d1:*')".to_string(),
            });
        }

        Ok(Self {
            vendor_id: Self::parse_half(s, parts[0], "VID")?,
            product_id: Self::parse_half(s, parts[1], "PID")?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(v) => write!(f, "{:#06x}", v)?,
            None => f.write_str("*")?,
        }
        f.write_str(":")?;
        match self.product_id {
            Some(p) => write!(f, "{:#06x}", p),
            None => f.write_str("*"),
        }
    }
}

/// USB endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint direction bit in a pipe ID (set = device-to-host)
pub const ENDPOINT_DIRECTION_MASK: u8 = 0x80;

/// One pipe (endpoint) of a claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeInfo {
    /// Endpoint address, including the direction bit
    pub pipe_id: u8,
    /// Transfer type of the endpoint
    pub kind: TransferKind,
    /// Maximum packet size reported by the descriptor
    pub max_packet_size: u16,
}

impl PipeInfo {
    /// True when the pipe carries data from device to host
    pub fn is_in(&self) -> bool {
        self.pipe_id & ENDPOINT_DIRECTION_MASK == ENDPOINT_DIRECTION_MASK
    }

    pub fn is_bulk(&self) -> bool {
        self.kind == TransferKind::Bulk
    }
}

/// Bulk pipe pair used by the echo relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    /// Bulk IN pipe (device-to-host)
    pub read: u8,
    /// Bulk OUT pipe (host-to-device)
    pub write: u8,
}

impl fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "read={:#04x} write={:#04x}", self.read, self.write)
    }
}

/// Per-device session state
///
/// ```text
/// Discovered -> Negotiating -> AccessoryActive -> Relaying -> Disconnected
///                    \-> Unsupported
/// Discovered -> AccessoryActive   (device already in accessory mode)
/// any        -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Device connected, nothing done yet
    Discovered,
    /// AOA handshake in progress
    Negotiating,
    /// Device does not speak AOA; left alone
    Unsupported,
    /// Device is (or was switched into) accessory mode
    AccessoryActive,
    /// Echo worker running on the resolved pipe pair
    Relaying,
    /// Device gone; record is about to be evicted
    Disconnected,
}

impl SessionState {
    /// Check whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Discovered, Negotiating) => true,
            (Discovered, AccessoryActive) => true,
            (Negotiating, AccessoryActive) => true,
            (Negotiating, Unsupported) => true,
            (AccessoryActive, Relaying) => true,
            _ => false,
        }
    }

    /// Terminal states accept no further transitions except disconnect
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Unsupported | SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Discovered => "discovered",
            SessionState::Negotiating => "negotiating",
            SessionState::Unsupported => "unsupported",
            SessionState::AccessoryActive => "accessory-active",
            SessionState::Relaying => "relaying",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// How the engine treats a newly connected device
///
/// The host assigns the class from the role of the watcher that reported the
/// device, so a wide accessory filter never sends a phone through negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Already enumerated in accessory mode: resolve pipes and relay
    Accessory,
    /// Switch it into accessory mode
    Switchable,
}

impl DeviceClass {
    /// Class implied by the identity alone (Google vendor ID plus an
    /// accessory product ID)
    pub fn classify(identity: &DeviceIdentity) -> Self {
        if identity.vendor_id == VENDOR_ID_GOOGLE
            && ACCESSORY_PRODUCT_IDS.contains(&identity.product_id)
        {
            DeviceClass::Accessory
        } else {
            DeviceClass::Switchable
        }
    }
}

/// USB error types
///
/// Structured result reported by a USB backend. `Timeout` is the expected
/// idle condition of a bulk read; everything else is a real failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device or endpoint not found
    #[error("device or endpoint not found")]
    NotFound,
    /// Device is busy
    #[error("device busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UsbError::Timeout)
    }
}
