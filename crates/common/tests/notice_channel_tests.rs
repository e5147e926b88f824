//! Hand-off channel and mock backend integration tests
//!
//! # Test Scenarios
//! - Notices flow from a callback thread to a dispatch thread in order
//! - Dispatch thread exits once the callback side is dropped
//! - Pump command channel shutdown
//! - Mock backend hotplug and transfer bookkeeping used by engine tests
//!
//! Run with: `cargo test -p common --test notice_channel_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, IoRecord, MockBackend, MockDevice, TEST_IO_TIMEOUT, wait_until,
};
use common::{HotplugNotice, NOTICE_CAPACITY, PumpCommand, UsbBackend, create_notice_channel};
use protocol::{ControlSetup, DeviceFilter, UsbError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

// ============================================================================
// Notice Channel Tests
// ============================================================================

#[test]
fn test_notices_preserve_order() {
    let (tx, rx) = create_notice_channel::<HotplugNotice<u32>>(NOTICE_CAPACITY);

    let dispatcher = thread::spawn(move || {
        let mut order = Vec::new();
        while let Ok(notice) = rx.recv_blocking() {
            order.push(match notice {
                HotplugNotice::Arrived(id) => (id, true),
                HotplugNotice::Left(id) => (id, false),
            });
        }
        order
    });

    for id in 0..10 {
        tx.send_blocking(HotplugNotice::Arrived(id)).unwrap();
    }
    for id in 0..10 {
        tx.send_blocking(HotplugNotice::Left(id)).unwrap();
    }
    drop(tx);

    let order = dispatcher.join().expect("Dispatcher panicked");
    assert_eq!(order.len(), 20);
    for id in 0..10u32 {
        let arrived = order.iter().position(|e| *e == (id, true)).unwrap();
        let left = order.iter().position(|e| *e == (id, false)).unwrap();
        assert!(arrived < left);
    }
}

#[test]
fn test_dispatch_thread_exits_when_sender_dropped() {
    let (tx, rx) = create_notice_channel::<HotplugNotice<u8>>(4);
    let finished = Arc::new(AtomicBool::new(false));
    let finished_clone = finished.clone();

    let dispatcher = thread::spawn(move || {
        while rx.recv_blocking().is_ok() {}
        finished_clone.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(20));
    assert!(!finished.load(Ordering::SeqCst));

    drop(tx);
    dispatcher.join().unwrap();
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_pump_shutdown_command() {
    let (cmd_tx, cmd_rx) = create_notice_channel::<PumpCommand>(4);
    let iterations = Arc::new(AtomicUsize::new(0));
    let iterations_clone = iterations.clone();

    let pump = thread::spawn(move || {
        loop {
            match cmd_rx.try_recv() {
                Ok(Some(PumpCommand::Shutdown)) | Err(_) => break,
                Ok(None) => {}
            }
            iterations_clone.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
        }
    });

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        iterations.load(Ordering::SeqCst) > 3
    }));
    cmd_tx.send_blocking(PumpCommand::Shutdown).unwrap();
    pump.join().unwrap();
}

// ============================================================================
// Mock Backend Tests
// ============================================================================

#[test]
fn test_mock_records_control_transfers() {
    let backend = MockBackend::new();
    let handle = backend.plug(MockDevice::switchable("R58M"));
    backend.open(handle).unwrap();

    let mut buf = [0u8; 2];
    let n = backend
        .control_in(handle, ControlSetup::get_protocol(), &mut buf, TEST_IO_TIMEOUT)
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(buf, [2, 0]);

    backend
        .control_out(handle, ControlSetup::start_accessory(), &[], TEST_IO_TIMEOUT)
        .unwrap();

    let controls = backend.controls(handle);
    assert_eq!(controls.len(), 2);
    assert_eq!(controls[0].setup, ControlSetup::get_protocol());
    assert!(controls[1].data.is_empty());
}

#[test]
fn test_mock_unsupported_protocol() {
    let backend = MockBackend::new();
    let handle = backend.plug(MockDevice::switchable("R58M").with_protocol_response(Err(UsbError::Pipe)));
    backend.open(handle).unwrap();

    let mut buf = [0u8; 2];
    assert_eq!(
        backend.control_in(handle, ControlSetup::get_protocol(), &mut buf, TEST_IO_TIMEOUT),
        Err(UsbError::Pipe)
    );
}

#[test]
fn test_mock_read_wakes_on_push() {
    let backend = MockBackend::new();
    let handle = backend.plug(MockDevice::accessory("R58M"));
    backend.open(handle).unwrap();

    let reader = {
        let backend = backend.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let n = backend
                .read_pipe(handle, 0x81, &mut buf, Duration::from_secs(2))
                .unwrap();
            buf[..n].to_vec()
        })
    };

    thread::sleep(Duration::from_millis(20));
    backend.push_read(handle, b"ping");
    assert_eq!(reader.join().unwrap(), b"ping");

    assert!(matches!(
        backend.io(handle).last(),
        Some(IoRecord::Read { result: Ok(4), .. })
    ));
}

#[test]
fn test_mock_list_devices_filters() {
    let backend = MockBackend::new();
    backend.plug(MockDevice::switchable("A"));
    let accessory = backend.plug(MockDevice::accessory("B"));

    let all = backend.list_devices(&"*:*".parse::<DeviceFilter>().unwrap()).unwrap();
    assert_eq!(all.len(), 2);

    backend.unplug(accessory);
    let google = backend
        .list_devices(&"0x18d1:*".parse::<DeviceFilter>().unwrap())
        .unwrap();
    assert!(google.is_empty());
}
