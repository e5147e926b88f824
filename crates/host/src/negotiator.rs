//! Accessory negotiator
//!
//! Runs the AOA handshake against a device that is not yet in accessory mode:
//! query the protocol version, send the six identification strings, then ask
//! the device to restart as an accessory. A successful handshake makes the
//! device drop off the bus and come back with a Google accessory product ID.

use common::UsbBackend;
use protocol::{
    AccessoryProtocolVersion, AccessoryString, AccessoryStrings, ControlSetup, DeviceHandle,
    DeviceIdentity, PROTOCOL_VERSION_LEN, ProtocolError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for handshake control transfers (5 seconds)
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AccessoryNegotiator {
    backend: Arc<dyn UsbBackend>,
    /// Identification strings, pre-encoded in slot order
    strings: Vec<(AccessoryString, Vec<u8>)>,
    timeout: Duration,
}

impl AccessoryNegotiator {
    /// Create a negotiator announcing `strings`
    ///
    /// Fails if any string is not strict 7-bit ASCII, so a bad configuration
    /// is caught before any device is touched.
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        strings: &AccessoryStrings,
        timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            backend,
            strings: strings.encode_all()?,
            timeout,
        })
    }

    /// Ask the device for its AOA protocol version
    ///
    /// Any non-empty response means the device speaks AOA. A transfer error
    /// or an empty response means it does not.
    pub fn query_protocol(&self, handle: DeviceHandle) -> Option<AccessoryProtocolVersion> {
        let mut buf = [0u8; PROTOCOL_VERSION_LEN];

        match self
            .backend
            .control_in(handle, ControlSetup::get_protocol(), &mut buf, self.timeout)
        {
            Ok(0) => {
                debug!("GET_PROTOCOL returned no data on {}", handle);
                None
            }
            Ok(_) => AccessoryProtocolVersion::from_response(&buf),
            Err(e) => {
                debug!("GET_PROTOCOL failed on {}: {}", handle, e);
                None
            }
        }
    }

    /// Switch the device into accessory mode
    ///
    /// Returns true if the device reported AOA support. The identification
    /// strings and the start request are sent best-effort: a failed transfer
    /// is logged and the handshake carries on.
    pub fn negotiate(&self, handle: DeviceHandle, identity: &DeviceIdentity) -> bool {
        info!("Attempting to open {} in accessory mode", identity);

        let Some(version) = self.query_protocol(handle) else {
            info!("{} does not support accessory mode", identity);
            return false;
        };
        debug!("{} speaks {}", identity, version);

        for (slot, payload) in &self.strings {
            if let Err(e) = self.backend.control_out(
                handle,
                ControlSetup::send_string(*slot),
                payload,
                self.timeout,
            ) {
                warn!(
                    "Failed to send {} string to {}: {}",
                    slot.name(),
                    identity,
                    e
                );
            }
        }

        if let Err(e) =
            self.backend
                .control_out(handle, ControlSetup::start_accessory(), &[], self.timeout)
        {
            warn!("Failed to send START to {}: {}", identity, e);
        }

        info!("Started {} in accessory mode", identity);
        true
    }
}
