//! rusb device wrappers
//!
//! [`identity_of`] snapshots the identity of an attached device. [`OpenDevice`]
//! owns an opened rusb handle together with the interface claimed on it and
//! the pipes of that interface.

use crate::usb::transfers::{map_rusb_error, map_transfer_type};
use protocol::{DeviceIdentity, PipeInfo, UsbError};
use rusb::{Context, Device, DeviceHandle};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Format the physical location as `bus-port.port...`
pub fn device_path(bus: u8, ports: &[u8]) -> String {
    if ports.is_empty() {
        return bus.to_string();
    }
    let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    format!("{}-{}", bus, ports.join("."))
}

/// Snapshot the identity of a device
///
/// The serial number needs the device to be opened; when that fails (usually
/// permissions) the identity carries no serial.
pub fn identity_of(device: &Device<Context>) -> Result<DeviceIdentity, UsbError> {
    let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

    let serial_number = descriptor.serial_number_string_index().and_then(|idx| {
        device
            .open()
            .and_then(|handle| handle.read_string_descriptor_ascii(idx))
            .map_err(|e| {
                debug!(
                    "Could not read serial of {:04x}:{:04x}: {}",
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    e
                )
            })
            .ok()
    });

    let ports = device.port_numbers().unwrap_or_default();

    Ok(DeviceIdentity {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        serial_number,
        bus_number: device.bus_number(),
        device_path: device_path(device.bus_number(), &ports),
    })
}

struct Claim {
    interface: u8,
    pipes: Vec<PipeInfo>,
    kernel_driver_detached: bool,
}

/// Opened device
pub struct OpenDevice {
    device: Device<Context>,
    handle: Mutex<DeviceHandle<Context>>,
    claim: Mutex<Option<Claim>>,
}

impl OpenDevice {
    pub fn open(device: Device<Context>) -> Result<Self, UsbError> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        Ok(Self {
            device,
            handle: Mutex::new(handle),
            claim: Mutex::new(None),
        })
    }

    /// Lock the rusb handle for a transfer
    pub fn handle(&self) -> Result<MutexGuard<'_, DeviceHandle<Context>>, UsbError> {
        self.handle.lock().map_err(|_| UsbError::Other {
            message: "device handle lock poisoned".to_string(),
        })
    }

    fn claim_slot(&self) -> MutexGuard<'_, Option<Claim>> {
        self.claim.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Interface numbers of the active configuration, ascending
    pub fn interfaces(&self) -> Result<Vec<u8>, UsbError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;

        let mut numbers: Vec<u8> = config.interfaces().map(|i| i.number()).collect();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    /// Pipes of `interface` (alternate setting 0), in descriptor order
    fn pipes_of(&self, interface: u8) -> Result<Vec<PipeInfo>, UsbError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;

        let pipes = config
            .interfaces()
            .filter(|i| i.number() == interface)
            .filter_map(|i| i.descriptors().next())
            .flat_map(|alt| {
                alt.endpoint_descriptors()
                    .map(|ep| PipeInfo {
                        pipe_id: ep.address(),
                        kind: map_transfer_type(ep.transfer_type()),
                        max_packet_size: ep.max_packet_size(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(pipes)
    }

    /// Claim `interface`, detaching a kernel driver first if one is bound
    ///
    /// Any previously claimed interface is released.
    pub fn claim(&self, interface: u8) -> Result<(), UsbError> {
        let pipes = self.pipes_of(interface)?;
        let mut handle = self.handle()?;
        let mut slot = self.claim_slot();

        if let Some(previous) = slot.take() {
            release(&mut handle, previous);
        }

        let kernel_driver_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => match handle.detach_kernel_driver(interface) {
                Ok(()) => {
                    debug!("Detached kernel driver from interface {}", interface);
                    true
                }
                Err(e) => {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                    false
                }
            },
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(map_rusb_error(e));
        }

        *slot = Some(Claim {
            interface,
            pipes,
            kernel_driver_detached,
        });
        Ok(())
    }

    /// Pipe `index` of the claimed interface
    pub fn pipe(&self, index: u8) -> Option<PipeInfo> {
        self.claim_slot()
            .as_ref()
            .and_then(|c| c.pipes.get(index as usize).copied())
    }

    pub fn reset(&self) -> Result<(), UsbError> {
        self.handle()?.reset().map_err(map_rusb_error)
    }

    /// Release the claimed interface and give it back to the kernel
    pub fn close(&self) {
        let claim = self.claim_slot().take();
        if let Some(claim) = claim {
            match self.handle() {
                Ok(mut handle) => release(&mut handle, claim),
                Err(e) => warn!("Could not release interface {}: {}", claim.interface, e),
            }
        }
    }
}

fn release(handle: &mut DeviceHandle<Context>, claim: Claim) {
    if let Err(e) = handle.release_interface(claim.interface) {
        debug!("Failed to release interface {}: {}", claim.interface, e);
    }

    if claim.kernel_driver_detached
        && let Err(e) = handle.attach_kernel_driver(claim.interface)
    {
        debug!(
            "Could not reattach kernel driver to interface {}: {}",
            claim.interface, e
        );
    }
}
