//! USB backend contract
//!
//! The accessory engine never talks to a USB library directly. Everything it
//! needs from the transport (hotplug notifications, open/close, interface
//! claim, control and bulk transfers, pipe enumeration) goes through
//! [`UsbBackend`]. A backend issues a fresh [`DeviceHandle`] for every
//! attachment and reports transfer outcomes as structured [`UsbError`]s, so
//! callers can tell an idle timeout from a real failure without asking the OS.

use protocol::{
    ControlSetup, DeviceFilter, DeviceHandle, DeviceIdentity, PipeInfo, UsbError,
};
use std::sync::Arc;
use std::time::Duration;

/// Receiver of hotplug notifications
///
/// Called on the backend's notification thread. Implementations should return
/// promptly; they must not assume they run on the thread that subscribed.
pub trait HotplugSink: Send + Sync {
    /// A device matching the subscription filter attached
    fn device_arrived(&self, handle: DeviceHandle, identity: DeviceIdentity);

    /// A device previously announced with `handle` detached
    fn device_left(&self, handle: DeviceHandle);
}

/// Live hotplug subscription
///
/// Dropping the subscription unsubscribes. Once `drop` returns no further
/// callbacks are delivered to the sink.
pub trait HotplugSubscription: Send {
    fn filter(&self) -> DeviceFilter;
}

/// Transport capabilities consumed by the engine
pub trait UsbBackend: Send + Sync {
    /// Enumerate attached devices matching `filter`
    fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<DeviceIdentity>, UsbError>;

    /// Subscribe to attach/detach notifications
    ///
    /// Devices already attached when the subscription is made are announced
    /// as arrivals.
    fn subscribe_hotplug(
        &self,
        filter: DeviceFilter,
        sink: Arc<dyn HotplugSink>,
    ) -> Result<Box<dyn HotplugSubscription>, UsbError>;

    /// Open a device announced through a hotplug notification
    fn open(&self, handle: DeviceHandle) -> Result<(), UsbError>;

    /// Release claimed interfaces and close the device
    ///
    /// Closing a handle that is not open is a no-op.
    fn close(&self, handle: DeviceHandle);

    /// Port-reset the device; it re-enumerates under a new handle
    fn reset(&self, handle: DeviceHandle) -> Result<(), UsbError>;

    /// Interface numbers of the active configuration, ascending
    fn interfaces(&self, handle: DeviceHandle) -> Result<Vec<u8>, UsbError>;

    /// Claim one interface; its pipes become visible to [`UsbBackend::query_pipe`]
    fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), UsbError>;

    /// Device-to-host control transfer, returns the number of bytes received
    fn control_in(
        &self,
        handle: DeviceHandle,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Host-to-device control transfer, returns the number of bytes sent
    fn control_out(
        &self,
        handle: DeviceHandle,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Pipe `index` of the claimed interface, or `None` past the last pipe
    fn query_pipe(&self, handle: DeviceHandle, index: u8) -> Option<PipeInfo>;

    /// Bulk read of up to `buf.len()` bytes
    fn read_pipe(
        &self,
        handle: DeviceHandle,
        pipe_id: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Bulk write; may write fewer bytes than `data.len()`
    fn write_pipe(
        &self,
        handle: DeviceHandle,
        pipe_id: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;
}
