//! USB transfer execution
//!
//! Thin synchronous wrappers over rusb control and bulk transfers. Every rusb
//! error is mapped to the protocol [`UsbError`] here, so callers only ever
//! see the structured result.

use protocol::{ControlSetup, TransferKind, UsbError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::trace;

/// Map a rusb error onto the backend-neutral error type
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}

/// Map a descriptor transfer type
pub fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Device-to-host control transfer
pub fn control_in(
    handle: &DeviceHandle<Context>,
    setup: ControlSetup,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    trace!(
        "Control IN: request_type={:#x}, request={}, value={:#x}, index={:#x}, len={}",
        setup.request_type,
        setup.request,
        setup.value,
        setup.index,
        buf.len()
    );

    handle
        .read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            timeout,
        )
        .map_err(map_rusb_error)
}

/// Host-to-device control transfer
pub fn control_out(
    handle: &DeviceHandle<Context>,
    setup: ControlSetup,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    trace!(
        "Control OUT: request_type={:#x}, request={}, value={:#x}, index={:#x}, len={}",
        setup.request_type,
        setup.request,
        setup.value,
        setup.index,
        data.len()
    );

    handle
        .write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            timeout,
        )
        .map_err(map_rusb_error)
}

/// Bulk IN transfer
pub fn bulk_read(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    handle
        .read_bulk(endpoint, buf, timeout)
        .map_err(map_rusb_error)
}

/// Bulk OUT transfer
pub fn bulk_write(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    handle
        .write_bulk(endpoint, data, timeout)
        .map_err(map_rusb_error)
}
