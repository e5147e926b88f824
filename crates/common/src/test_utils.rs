//! Test utilities for aoa-echo
//!
//! Provides a scripted in-memory [`UsbBackend`] and helpers for building
//! device identities and waiting on background threads.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockBackend, MockDevice};
//! use common::UsbBackend;
//!
//! let backend = MockBackend::new();
//! let handle = backend.plug(MockDevice::accessory("SN0001"));
//! backend.open(handle).unwrap();
//! assert!(backend.is_open(handle));
//! ```

use crate::backend::{HotplugSink, HotplugSubscription, UsbBackend};
use protocol::{
    ControlSetup, DeviceFilter, DeviceHandle, DeviceIdentity, PRODUCT_ID_ACCESSORY_ADB,
    PRODUCT_ID_SAMSUNG, PipeInfo, TransferKind, UsbError, VENDOR_ID_GOOGLE, VENDOR_ID_SAMSUNG,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short bulk I/O timeout so idle workers spin quickly in tests
pub const TEST_IO_TIMEOUT: Duration = Duration::from_millis(20);

/// Identity of a phone in its normal (switchable) mode
pub fn switchable_identity(serial: &str) -> DeviceIdentity {
    DeviceIdentity {
        vendor_id: VENDOR_ID_SAMSUNG,
        product_id: PRODUCT_ID_SAMSUNG,
        serial_number: Some(serial.to_string()),
        bus_number: 1,
        device_path: format!("1-{}", serial.len()),
    }
}

/// Identity of a phone after switching into accessory mode
pub fn accessory_identity(serial: &str) -> DeviceIdentity {
    DeviceIdentity {
        vendor_id: VENDOR_ID_GOOGLE,
        product_id: PRODUCT_ID_ACCESSORY_ADB,
        serial_number: Some(serial.to_string()),
        bus_number: 1,
        device_path: format!("1-{}", serial.len()),
    }
}

/// Bulk pipe description
pub fn bulk_pipe(pipe_id: u8) -> PipeInfo {
    PipeInfo {
        pipe_id,
        kind: TransferKind::Bulk,
        max_packet_size: 512,
    }
}

/// Interrupt pipe description
pub fn interrupt_pipe(pipe_id: u8) -> PipeInfo {
    PipeInfo {
        pipe_id,
        kind: TransferKind::Interrupt,
        max_packet_size: 64,
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Script for one simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub identity: DeviceIdentity,
    /// Interfaces of the active configuration
    pub interfaces: Vec<u8>,
    /// Interfaces that refuse to be claimed
    pub unclaimable: Vec<u8>,
    /// Error returned by `open`, if any
    pub open_error: Option<UsbError>,
    /// Pipes of the claimed interface, in index order
    pub pipes: Vec<PipeInfo>,
    /// Outcome of `GET_PROTOCOL`: bytes returned, or a transfer error
    pub protocol_response: Result<Vec<u8>, UsbError>,
    /// Error returned by every control OUT transfer, if any
    pub control_out_error: Option<UsbError>,
}

impl MockDevice {
    /// A phone that answers `GET_PROTOCOL` with version 2
    pub fn switchable(serial: &str) -> Self {
        Self {
            identity: switchable_identity(serial),
            interfaces: vec![0],
            unclaimable: Vec::new(),
            open_error: None,
            pipes: vec![bulk_pipe(0x81), bulk_pipe(0x01)],
            protocol_response: Ok(vec![2, 0]),
            control_out_error: None,
        }
    }

    /// A phone already in accessory mode with one bulk IN/OUT pair
    pub fn accessory(serial: &str) -> Self {
        Self {
            identity: accessory_identity(serial),
            ..Self::switchable(serial)
        }
    }

    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_pipes(mut self, pipes: Vec<PipeInfo>) -> Self {
        self.pipes = pipes;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<u8>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_unclaimable(mut self, interfaces: Vec<u8>) -> Self {
        self.unclaimable = interfaces;
        self
    }

    pub fn with_open_error(mut self, error: UsbError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn with_protocol_response(mut self, response: Result<Vec<u8>, UsbError>) -> Self {
        self.protocol_response = response;
        self
    }

    pub fn with_control_out_error(mut self, error: UsbError) -> Self {
        self.control_out_error = Some(error);
        self
    }
}

/// One control transfer as seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub setup: ControlSetup,
    /// Payload for OUT transfers, requested length (zeroed) for IN transfers
    pub data: Vec<u8>,
}

/// One bulk transfer as seen by the device, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoRecord {
    Read {
        pipe_id: u8,
        result: Result<usize, UsbError>,
    },
    Write {
        pipe_id: u8,
        data: Vec<u8>,
        result: Result<usize, UsbError>,
    },
}

#[derive(Debug)]
enum ReadStep {
    Data(Vec<u8>),
    Fail(UsbError),
}

struct DeviceState {
    script: MockDevice,
    attached: bool,
    open: bool,
    claimed: Option<u8>,
    reads: VecDeque<ReadStep>,
    write_failures: VecDeque<UsbError>,
    controls: Vec<ControlRecord>,
    io: Vec<IoRecord>,
    opens: usize,
    closes: usize,
    resets: usize,
}

impl DeviceState {
    fn new(script: MockDevice) -> Self {
        Self {
            script,
            attached: true,
            open: false,
            claimed: None,
            reads: VecDeque::new(),
            write_failures: VecDeque::new(),
            controls: Vec::new(),
            io: Vec::new(),
            opens: 0,
            closes: 0,
            resets: 0,
        }
    }
}

struct Subscriber {
    filter: DeviceFilter,
    sink: Arc<dyn HotplugSink>,
}

#[derive(Default)]
struct MockState {
    devices: HashMap<DeviceHandle, DeviceState>,
    subscribers: HashMap<u64, Subscriber>,
    next_handle: u64,
    next_subscription: u64,
}

#[derive(Default)]
struct MockInner {
    state: Mutex<MockState>,
    data_ready: Condvar,
}

impl MockInner {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Scripted in-memory USB backend
///
/// Hotplug notifications are delivered synchronously on the thread calling
/// [`MockBackend::plug`] / [`MockBackend::unplug`], standing in for the
/// backend's notification thread. Every transfer is recorded per handle.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device and notify matching subscribers
    pub fn plug(&self, device: MockDevice) -> DeviceHandle {
        let identity = device.identity.clone();
        let (handle, sinks) = {
            let mut state = self.inner.lock();
            state.next_handle += 1;
            let handle = DeviceHandle(state.next_handle);
            state.devices.insert(handle, DeviceState::new(device));
            (handle, Self::matching_sinks(&state, &identity))
        };

        for sink in sinks {
            sink.device_arrived(handle, identity.clone());
        }
        handle
    }

    /// Deliver a second arrival notification for an already attached handle
    pub fn repeat_arrival(&self, handle: DeviceHandle) {
        let (identity, sinks) = {
            let state = self.inner.lock();
            let Some(device) = state.devices.get(&handle) else {
                return;
            };
            let identity = device.script.identity.clone();
            let sinks = Self::matching_sinks(&state, &identity);
            (identity, sinks)
        };

        for sink in sinks {
            sink.device_arrived(handle, identity.clone());
        }
    }

    /// Detach a device and notify matching subscribers
    ///
    /// Pending and future I/O on the handle fails with `NoDevice`.
    pub fn unplug(&self, handle: DeviceHandle) {
        let sinks = {
            let mut state = self.inner.lock();
            let Some(device) = state.devices.get_mut(&handle) else {
                return;
            };
            device.attached = false;
            let identity = device.script.identity.clone();
            Self::matching_sinks(&state, &identity)
        };
        self.inner.data_ready.notify_all();

        for sink in sinks {
            sink.device_left(handle);
        }
    }

    /// Deliver a detach notification for a handle this backend never issued
    pub fn spurious_departure(&self, handle: DeviceHandle) {
        let sinks: Vec<Arc<dyn HotplugSink>> = {
            let state = self.inner.lock();
            state.subscribers.values().map(|s| s.sink.clone()).collect()
        };

        for sink in sinks {
            sink.device_left(handle);
        }
    }

    /// Queue bytes for the next bulk read on `handle`
    pub fn push_read(&self, handle: DeviceHandle, data: &[u8]) {
        self.push_step(handle, ReadStep::Data(data.to_vec()));
    }

    /// Make the next bulk read on `handle` fail
    pub fn push_read_error(&self, handle: DeviceHandle, error: UsbError) {
        self.push_step(handle, ReadStep::Fail(error));
    }

    /// Make the next bulk write on `handle` fail
    pub fn fail_next_write(&self, handle: DeviceHandle, error: UsbError) {
        let mut state = self.inner.lock();
        if let Some(device) = state.devices.get_mut(&handle) {
            device.write_failures.push_back(error);
        }
    }

    pub fn controls(&self, handle: DeviceHandle) -> Vec<ControlRecord> {
        self.with_device(handle, |d| d.controls.clone())
            .unwrap_or_default()
    }

    pub fn io(&self, handle: DeviceHandle) -> Vec<IoRecord> {
        self.with_device(handle, |d| d.io.clone()).unwrap_or_default()
    }

    /// Payloads of successful bulk writes, in order
    pub fn writes(&self, handle: DeviceHandle) -> Vec<Vec<u8>> {
        self.io(handle)
            .into_iter()
            .filter_map(|record| match record {
                IoRecord::Write {
                    data, result: Ok(_), ..
                } => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn is_open(&self, handle: DeviceHandle) -> bool {
        self.with_device(handle, |d| d.open).unwrap_or(false)
    }

    pub fn claimed_interface(&self, handle: DeviceHandle) -> Option<u8> {
        self.with_device(handle, |d| d.claimed).flatten()
    }

    pub fn open_count(&self, handle: DeviceHandle) -> usize {
        self.with_device(handle, |d| d.opens).unwrap_or(0)
    }

    pub fn close_count(&self, handle: DeviceHandle) -> usize {
        self.with_device(handle, |d| d.closes).unwrap_or(0)
    }

    pub fn reset_count(&self, handle: DeviceHandle) -> usize {
        self.with_device(handle, |d| d.resets).unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn push_step(&self, handle: DeviceHandle, step: ReadStep) {
        {
            let mut state = self.inner.lock();
            if let Some(device) = state.devices.get_mut(&handle) {
                device.reads.push_back(step);
            }
        }
        self.inner.data_ready.notify_all();
    }

    fn with_device<T>(&self, handle: DeviceHandle, f: impl FnOnce(&DeviceState) -> T) -> Option<T> {
        let state = self.inner.lock();
        state.devices.get(&handle).map(f)
    }

    fn matching_sinks(state: &MockState, identity: &DeviceIdentity) -> Vec<Arc<dyn HotplugSink>> {
        let mut ids: Vec<&u64> = state.subscribers.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| &state.subscribers[id])
            .filter(|s| s.filter.matches(identity.vendor_id, identity.product_id))
            .map(|s| s.sink.clone())
            .collect()
    }

    fn open_device<'a>(
        state: &'a mut MockState,
        handle: DeviceHandle,
    ) -> Result<&'a mut DeviceState, UsbError> {
        let device = state.devices.get_mut(&handle).ok_or(UsbError::NotFound)?;
        if !device.attached {
            return Err(UsbError::NoDevice);
        }
        if !device.open {
            return Err(UsbError::InvalidParam);
        }
        Ok(device)
    }
}

struct MockSubscription {
    id: u64,
    filter: DeviceFilter,
    inner: Weak<MockInner>,
}

impl HotplugSubscription for MockSubscription {
    fn filter(&self) -> DeviceFilter {
        self.filter
    }
}

impl Drop for MockSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().subscribers.remove(&self.id);
        }
    }
}

impl UsbBackend for MockBackend {
    fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<DeviceIdentity>, UsbError> {
        let state = self.inner.lock();
        let mut handles: Vec<&DeviceHandle> = state.devices.keys().collect();
        handles.sort();
        Ok(handles
            .into_iter()
            .map(|h| &state.devices[h])
            .filter(|d| d.attached)
            .map(|d| d.script.identity.clone())
            .filter(|id| filter.matches(id.vendor_id, id.product_id))
            .collect())
    }

    fn subscribe_hotplug(
        &self,
        filter: DeviceFilter,
        sink: Arc<dyn HotplugSink>,
    ) -> Result<Box<dyn HotplugSubscription>, UsbError> {
        let (id, present) = {
            let mut state = self.inner.lock();
            state.next_subscription += 1;
            let id = state.next_subscription;
            state.subscribers.insert(
                id,
                Subscriber {
                    filter,
                    sink: sink.clone(),
                },
            );

            let mut present: Vec<(DeviceHandle, DeviceIdentity)> = state
                .devices
                .iter()
                .filter(|(_, d)| d.attached)
                .filter(|(_, d)| {
                    filter.matches(d.script.identity.vendor_id, d.script.identity.product_id)
                })
                .map(|(h, d)| (*h, d.script.identity.clone()))
                .collect();
            present.sort_by_key(|(h, _)| *h);
            (id, present)
        };

        for (handle, identity) in present {
            sink.device_arrived(handle, identity);
        }

        Ok(Box::new(MockSubscription {
            id,
            filter,
            inner: Arc::downgrade(&self.inner),
        }))
    }

    fn open(&self, handle: DeviceHandle) -> Result<(), UsbError> {
        let mut state = self.inner.lock();
        let device = state.devices.get_mut(&handle).ok_or(UsbError::NotFound)?;
        if !device.attached {
            return Err(UsbError::NoDevice);
        }
        if let Some(error) = &device.script.open_error {
            return Err(error.clone());
        }
        device.open = true;
        device.opens += 1;
        Ok(())
    }

    fn close(&self, handle: DeviceHandle) {
        let mut state = self.inner.lock();
        if let Some(device) = state.devices.get_mut(&handle)
            && device.open
        {
            device.open = false;
            device.claimed = None;
            device.closes += 1;
        }
    }

    fn reset(&self, handle: DeviceHandle) -> Result<(), UsbError> {
        let mut state = self.inner.lock();
        let device = Self::open_device(&mut state, handle)?;
        device.resets += 1;
        Ok(())
    }

    fn interfaces(&self, handle: DeviceHandle) -> Result<Vec<u8>, UsbError> {
        let mut state = self.inner.lock();
        let device = Self::open_device(&mut state, handle)?;
        Ok(device.script.interfaces.clone())
    }

    fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), UsbError> {
        let mut state = self.inner.lock();
        let device = Self::open_device(&mut state, handle)?;
        if !device.script.interfaces.contains(&interface) {
            return Err(UsbError::NotFound);
        }
        if device.script.unclaimable.contains(&interface) {
            return Err(UsbError::Busy);
        }
        device.claimed = Some(interface);
        Ok(())
    }

    fn control_in(
        &self,
        handle: DeviceHandle,
        setup: ControlSetup,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut state = self.inner.lock();
        let device = Self::open_device(&mut state, handle)?;
        device.controls.push(ControlRecord {
            setup,
            data: vec![0; buf.len()],
        });

        let response = device.script.protocol_response.clone()?;
        let len = response.len().min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }

    fn control_out(
        &self,
        handle: DeviceHandle,
        setup: ControlSetup,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut state = self.inner.lock();
        let device = Self::open_device(&mut state, handle)?;
        device.controls.push(ControlRecord {
            setup,
            data: data.to_vec(),
        });

        match &device.script.control_out_error {
            Some(error) => Err(error.clone()),
            None => Ok(data.len()),
        }
    }

    fn query_pipe(&self, handle: DeviceHandle, index: u8) -> Option<PipeInfo> {
        let state = self.inner.lock();
        let device = state.devices.get(&handle)?;
        device.claimed?;
        device.script.pipes.get(index as usize).copied()
    }

    fn read_pipe(
        &self,
        handle: DeviceHandle,
        pipe_id: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();

        let result = loop {
            let device = Self::open_device(&mut state, handle)?;

            match device.reads.pop_front() {
                Some(ReadStep::Data(mut data)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    if len < data.len() {
                        let rest = data.split_off(len);
                        device.reads.push_front(ReadStep::Data(rest));
                    }
                    break Ok(len);
                }
                Some(ReadStep::Fail(error)) => break Err(error),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                break Err(UsbError::Timeout);
            }
            state = self
                .inner
                .data_ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        };

        if let Some(device) = state.devices.get_mut(&handle) {
            device.io.push(IoRecord::Read {
                pipe_id,
                result: result.clone(),
            });
        }
        result
    }

    fn write_pipe(
        &self,
        handle: DeviceHandle,
        pipe_id: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut state = self.inner.lock();
        let device = Self::open_device(&mut state, handle)?;

        let result = match device.write_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(data.len()),
        };
        device.io.push(IoRecord::Write {
            pipe_id,
            data: data.to_vec(),
            result: result.clone(),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        arrived: Mutex<Vec<DeviceHandle>>,
        left: Mutex<Vec<DeviceHandle>>,
    }

    impl HotplugSink for CountingSink {
        fn device_arrived(&self, handle: DeviceHandle, _identity: DeviceIdentity) {
            self.arrived.lock().unwrap().push(handle);
        }

        fn device_left(&self, handle: DeviceHandle) {
            self.left.lock().unwrap().push(handle);
        }
    }

    #[test]
    fn test_subscription_filters_and_enumerates() {
        let backend = MockBackend::new();
        let present = backend.plug(MockDevice::accessory("A"));
        backend.plug(MockDevice::switchable("B"));

        let sink = Arc::new(CountingSink {
            arrived: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
        });
        let filter = DeviceFilter::exact(VENDOR_ID_GOOGLE, PRODUCT_ID_ACCESSORY_ADB);
        let subscription = backend.subscribe_hotplug(filter, sink.clone()).unwrap();
        assert_eq!(*sink.arrived.lock().unwrap(), vec![present]);

        let later = backend.plug(MockDevice::accessory("C"));
        backend.unplug(later);
        assert_eq!(sink.arrived.lock().unwrap().len(), 2);
        assert_eq!(*sink.left.lock().unwrap(), vec![later]);

        drop(subscription);
        assert_eq!(backend.subscription_count(), 0);
        backend.plug(MockDevice::accessory("D"));
        assert_eq!(sink.arrived.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_read_times_out_then_returns_queued_data() {
        let backend = MockBackend::new();
        let handle = backend.plug(MockDevice::accessory("A"));
        backend.open(handle).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            backend.read_pipe(handle, 0x81, &mut buf, TEST_IO_TIMEOUT),
            Err(UsbError::Timeout)
        );

        backend.push_read(handle, b"hello");
        assert_eq!(backend.read_pipe(handle, 0x81, &mut buf, TEST_IO_TIMEOUT), Ok(4));
        assert_eq!(&buf, b"hell");
        assert_eq!(backend.read_pipe(handle, 0x81, &mut buf, TEST_IO_TIMEOUT), Ok(1));
        assert_eq!(buf[0], b'o');
    }

    #[test]
    fn test_io_requires_open_and_attached() {
        let backend = MockBackend::new();
        let handle = backend.plug(MockDevice::accessory("A"));

        let mut buf = [0u8; 4];
        assert_eq!(
            backend.read_pipe(handle, 0x81, &mut buf, TEST_IO_TIMEOUT),
            Err(UsbError::InvalidParam)
        );

        backend.open(handle).unwrap();
        backend.unplug(handle);
        assert_eq!(
            backend.write_pipe(handle, 0x01, b"x", TEST_IO_TIMEOUT),
            Err(UsbError::NoDevice)
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = MockBackend::new();
        let handle = backend.plug(MockDevice::accessory("A"));
        backend.open(handle).unwrap();
        backend.claim_interface(handle, 0).unwrap();

        backend.close(handle);
        backend.close(handle);
        assert_eq!(backend.close_count(handle), 1);
        assert_eq!(backend.claimed_interface(handle), None);
    }
}
