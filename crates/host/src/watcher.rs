//! Device watcher
//!
//! Subscribes to backend hotplug notifications for one vendor/product filter,
//! opens and claims each arriving device, tracks it in a [`DeviceRegistry`]
//! and raises [`DeviceEvent`]s through the configured handler.
//!
//! Events are dispatched on the backend's notification thread while the
//! registry lock is held. That keeps Connected/Disconnected for a handle in
//! order and lets `stop` drain the registry without racing a late arrival.

use crate::error::LifecycleError;
use crate::events::{DeviceEvent, DeviceEventHandler};
use crate::registry::{DeviceRecord, DeviceRegistry, DuplicateHandle};
use common::{HotplugSink, HotplugSubscription, UsbBackend};
use protocol::{DeviceClass, DeviceFilter, DeviceHandle, DeviceIdentity, SessionState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

struct WatcherShared {
    name: String,
    /// Class stamped on every record this watcher creates
    class: DeviceClass,
    backend: Arc<dyn UsbBackend>,
    handler: Arc<dyn DeviceEventHandler>,
    registry: Mutex<DeviceRegistry>,
    /// Cleared before the subscription is dropped; late notifications are ignored
    accepting: AtomicBool,
}

impl WatcherShared {
    fn registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the first interface that accepts
    fn claim_any(&self, handle: DeviceHandle, identity: &DeviceIdentity) -> Option<u8> {
        let interfaces = match self.backend.interfaces(handle) {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Failed to read interfaces of {}: {}", identity, e);
                return None;
            }
        };

        interfaces.into_iter().find(|&interface| {
            match self.backend.claim_interface(handle, interface) {
                Ok(()) => {
                    debug!("Claimed interface {} on {}", interface, identity);
                    true
                }
                Err(e) => {
                    debug!(
                        "Could not claim interface {} on {}: {}",
                        interface, identity, e
                    );
                    false
                }
            }
        })
    }

    fn dispatch_disconnect(&self, record: &mut DeviceRecord) {
        let event = DeviceEvent::Disconnected {
            handle: record.handle,
        };
        self.handler.handle_event(&event, record);

        if record.open {
            self.backend.close(record.handle);
            record.open = false;
        }
    }
}

impl HotplugSink for WatcherShared {
    fn device_arrived(&self, handle: DeviceHandle, identity: DeviceIdentity) {
        let mut registry = self.registry();

        if !self.accepting.load(Ordering::SeqCst) {
            debug!("{}: ignoring arrival of {} while stopped", self.name, handle);
            return;
        }

        if registry.contains(handle) {
            error!(
                "{}: duplicate arrival of {} ({}), ignoring",
                self.name, identity, handle
            );
            return;
        }

        if let Err(e) = self.backend.open(handle) {
            warn!("{}: failed to open {}: {}", self.name, identity, e);
            return;
        }

        let Some(interface) = self.claim_any(handle, &identity) else {
            warn!("{}: no claimable interface on {}, skipping", self.name, identity);
            self.backend.close(handle);
            return;
        };

        let record = DeviceRecord::new(handle, identity.clone(), self.class, interface);
        let record = match registry.insert(record) {
            Ok(record) => record,
            Err(DuplicateHandle(handle)) => {
                error!("{}: {} tracked twice", self.name, handle);
                return;
            }
        };

        let event = DeviceEvent::Connected { identity, handle };
        self.handler.handle_event(&event, record);
    }

    fn device_left(&self, handle: DeviceHandle) {
        let mut registry = self.registry();

        if registry.forget_retired(handle) {
            debug!("{}: retired device {} left", self.name, handle);
            return;
        }

        let Some(record) = registry.get_mut(handle) else {
            if self.accepting.load(Ordering::SeqCst) {
                error!(
                    "{}: departure of untracked device {}, ignoring",
                    self.name, handle
                );
            }
            return;
        };

        self.dispatch_disconnect(record);
        registry.remove(handle);
    }
}

/// Hotplug watcher for one device filter
pub struct DeviceWatcher {
    filter: DeviceFilter,
    shared: Arc<WatcherShared>,
    subscription: Mutex<Option<Box<dyn HotplugSubscription>>>,
    disposed: AtomicBool,
}

impl DeviceWatcher {
    /// Watcher for devices matching `filter`, each handled as `class`
    pub fn new(
        name: impl Into<String>,
        filter: DeviceFilter,
        class: DeviceClass,
        backend: Arc<dyn UsbBackend>,
        handler: Arc<dyn DeviceEventHandler>,
    ) -> Self {
        Self {
            filter,
            shared: Arc::new(WatcherShared {
                name: name.into(),
                class,
                backend,
                handler,
                registry: Mutex::new(DeviceRegistry::new()),
                accepting: AtomicBool::new(false),
            }),
            subscription: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn filter(&self) -> DeviceFilter {
        self.filter
    }

    pub fn class(&self) -> DeviceClass {
        self.shared.class
    }

    fn subscription(&self) -> MutexGuard<'_, Option<Box<dyn HotplugSubscription>>> {
        self.subscription.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn misuse(&self, err: LifecycleError) -> LifecycleError {
        error!("{}", err);
        err
    }

    fn component(&self) -> String {
        format!("{} ({})", self.shared.name, self.filter)
    }

    /// Subscribe to hotplug notifications
    ///
    /// Devices already attached are announced as arrivals before this returns.
    pub fn start(&self) -> Result<(), LifecycleError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(self.misuse(LifecycleError::Disposed {
                component: self.component(),
            }));
        }

        let mut subscription = self.subscription();
        if subscription.is_some() {
            return Err(self.misuse(LifecycleError::AlreadyRunning {
                component: self.component(),
            }));
        }

        info!("Starting {}", self.component());
        self.shared.accepting.store(true, Ordering::SeqCst);

        match self
            .shared
            .backend
            .subscribe_hotplug(self.filter, self.shared.clone())
        {
            Ok(handle) => {
                *subscription = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.accepting.store(false, Ordering::SeqCst);
                error!("Failed to subscribe {}: {}", self.component(), e);
                Err(e.into())
            }
        }
    }

    /// Unsubscribe and disconnect every tracked device
    ///
    /// Every tracked worker is cancelled first, then each device gets its
    /// Disconnected dispatch and is closed. Returns the number of devices
    /// disconnected.
    pub fn stop(&self) -> Result<usize, LifecycleError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(self.misuse(LifecycleError::Disposed {
                component: self.component(),
            }));
        }

        let Some(subscription) = self.subscription().take() else {
            return Err(self.misuse(LifecycleError::NotRunning {
                component: self.component(),
            }));
        };

        info!("Stopping {}", self.component());
        self.shared.accepting.store(false, Ordering::SeqCst);
        drop(subscription);

        let mut registry = self.shared.registry();
        let mut records = registry.drain();

        for token in records.iter().filter_map(|r| r.worker.as_ref()) {
            token.cancel();
        }

        for record in &mut records {
            self.shared.dispatch_disconnect(record);
        }
        drop(registry);

        info!(
            "Stopped {}, disconnected {} devices",
            self.component(),
            records.len()
        );
        Ok(records.len())
    }

    /// Stop if running and refuse any further use
    pub fn dispose(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if self.is_running() {
            let _ = self.stop();
        }
        self.disposed.store(true, Ordering::SeqCst);
        debug!("Disposed {}", self.component());
    }

    /// Disconnect a device that is still attached but whose relay died
    ///
    /// Runs the Disconnected dispatch, closes the device and evicts its
    /// record. The device's later departure is expected and not reported as
    /// an anomaly. Returns false if the handle is not tracked here.
    pub fn retire(&self, handle: DeviceHandle) -> bool {
        let mut registry = self.shared.registry();

        let Some(record) = registry.get_mut(handle) else {
            return false;
        };

        warn!(
            "{}: retiring {} ({}) after its relay failed",
            self.shared.name, record.identity, handle
        );
        self.shared.dispatch_disconnect(record);
        registry.retire(handle);
        true
    }

    pub fn is_running(&self) -> bool {
        self.subscription().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Handles currently tracked, ascending
    pub fn tracked_devices(&self) -> Vec<DeviceHandle> {
        self.shared.registry().handles()
    }

    pub fn session_state(&self, handle: DeviceHandle) -> Option<SessionState> {
        self.shared.registry().get(handle).map(|r| r.state())
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}
