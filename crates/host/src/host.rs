//! Accessory host
//!
//! Composition root: one backend, one event router with its negotiator and
//! echo bridge, and two device watchers. The accessory watcher picks up
//! devices already in accessory mode; the switchable watcher catches phones
//! in their normal mode and negotiates them over. A relay reaper runs the
//! Disconnected path for devices whose echo worker died.

use crate::config::HostConfig;
use crate::echo::{EchoBridge, RelayConfig};
use crate::error::LifecycleError;
use crate::negotiator::{AccessoryNegotiator, DEFAULT_CONTROL_TIMEOUT};
use crate::reaper::RelayReaper;
use crate::router::EventRouter;
use crate::watcher::DeviceWatcher;
use common::UsbBackend;
use protocol::{
    AccessoryStrings, DeviceClass, DeviceFilter, DeviceHandle, PRODUCT_ID_ACCESSORY_ADB, PRODUCT_ID_SAMSUNG,
    ProtocolError, VENDOR_ID_GOOGLE, VENDOR_ID_SAMSUNG,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

/// Everything the host needs besides the backend
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub switchable: DeviceFilter,
    pub accessory: DeviceFilter,
    pub strings: AccessoryStrings,
    pub control_timeout: Duration,
    pub reset_after_negotiation: bool,
    pub relay: RelayConfig,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            switchable: DeviceFilter::exact(VENDOR_ID_SAMSUNG, PRODUCT_ID_SAMSUNG),
            accessory: DeviceFilter::exact(VENDOR_ID_GOOGLE, PRODUCT_ID_ACCESSORY_ADB),
            strings: AccessoryStrings::default(),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            reset_after_negotiation: true,
            relay: RelayConfig::default(),
        }
    }
}

impl HostOptions {
    pub fn from_config(config: &HostConfig) -> anyhow::Result<Self> {
        Ok(Self {
            switchable: config.watch.switchable_filter()?,
            accessory: config.watch.accessory_filter()?,
            strings: config.accessory.clone(),
            control_timeout: config.negotiation.control_timeout(),
            reset_after_negotiation: config.negotiation.reset_after_negotiation,
            relay: config.relay.relay_config(),
        })
    }
}

pub struct AccessoryHost {
    echo: Arc<EchoBridge>,
    accessory: Arc<DeviceWatcher>,
    switchable: Arc<DeviceWatcher>,
    reaper: Mutex<Option<RelayReaper>>,
}

impl AccessoryHost {
    /// Wire up the host; nothing is subscribed until [`AccessoryHost::start`]
    pub fn new(backend: Arc<dyn UsbBackend>, options: HostOptions) -> Result<Self, ProtocolError> {
        let negotiator =
            AccessoryNegotiator::new(backend.clone(), &options.strings, options.control_timeout)?;
        let echo = Arc::new(EchoBridge::new(backend.clone(), options.relay));
        let router = Arc::new(EventRouter::new(
            backend.clone(),
            negotiator,
            echo.clone(),
            options.reset_after_negotiation,
        ));

        let accessory = Arc::new(DeviceWatcher::new(
            "accessory watcher",
            options.accessory,
            DeviceClass::Accessory,
            backend.clone(),
            router.clone(),
        ));
        let switchable = Arc::new(DeviceWatcher::new(
            "switchable watcher",
            options.switchable,
            DeviceClass::Switchable,
            backend,
            router,
        ));

        Ok(Self {
            echo,
            accessory,
            switchable,
            reaper: Mutex::new(None),
        })
    }

    fn reaper(&self) -> MutexGuard<'_, Option<RelayReaper>> {
        self.reaper.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the relay reaper, the accessory watcher, then the switchable watcher
    pub fn start(&self) -> Result<(), LifecycleError> {
        if self.is_running() {
            return Err(LifecycleError::AlreadyRunning {
                component: "accessory host".to_string(),
            });
        }

        let reaper = RelayReaper::spawn(
            self.echo.clone(),
            vec![self.accessory.clone(), self.switchable.clone()],
        )
        .map_err(|e| LifecycleError::Spawn {
            component: "relay reaper".to_string(),
            message: e.to_string(),
        })?;

        if let Err(e) = self.accessory.start() {
            reaper.shutdown();
            return Err(e);
        }

        if let Err(e) = self.switchable.start() {
            let _ = self.accessory.stop();
            reaper.shutdown();
            return Err(e);
        }

        *self.reaper() = Some(reaper);

        info!(
            "Accessory host started (switchable {}, accessory {})",
            self.switchable.filter(),
            self.accessory.filter()
        );
        Ok(())
    }

    /// Stop both watchers in reverse start order, then any leftover worker
    ///
    /// Returns the number of devices disconnected.
    pub fn stop(&self) -> Result<usize, LifecycleError> {
        if !self.is_running() {
            return Err(LifecycleError::NotRunning {
                component: "accessory host".to_string(),
            });
        }

        if let Some(reaper) = self.reaper().take() {
            reaper.shutdown();
        }

        let mut disconnected = 0;
        for watcher in [&self.switchable, &self.accessory] {
            if watcher.is_running() {
                disconnected += watcher.stop()?;
            }
        }

        let leftover = self.echo.stop_all();
        info!(
            "Accessory host stopped: {} devices disconnected, {} leftover workers",
            disconnected, leftover
        );
        Ok(disconnected)
    }

    pub fn is_running(&self) -> bool {
        self.accessory.is_running() || self.switchable.is_running()
    }

    pub fn echo(&self) -> &Arc<EchoBridge> {
        &self.echo
    }

    pub fn accessory_watcher(&self) -> &DeviceWatcher {
        &self.accessory
    }

    pub fn switchable_watcher(&self) -> &DeviceWatcher {
        &self.switchable
    }

    /// Handles tracked by either watcher
    pub fn tracked_devices(&self) -> Vec<DeviceHandle> {
        let mut handles = self.switchable.tracked_devices();
        handles.extend(self.accessory.tracked_devices());
        handles.sort();
        handles
    }
}

impl Drop for AccessoryHost {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBackend, MockDevice, TEST_IO_TIMEOUT};

    fn host(backend: &MockBackend) -> AccessoryHost {
        let options = HostOptions {
            relay: RelayConfig {
                io_timeout: TEST_IO_TIMEOUT,
                buffer_size: 512,
            },
            ..HostOptions::default()
        };
        AccessoryHost::new(Arc::new(backend.clone()), options).unwrap()
    }

    #[test]
    fn test_start_stop() {
        let backend = MockBackend::new();
        let host = host(&backend);

        host.start().unwrap();
        assert!(host.is_running());
        assert_eq!(backend.subscription_count(), 2);

        assert_eq!(host.stop(), Ok(0));
        assert!(!host.is_running());
        assert_eq!(backend.subscription_count(), 0);
        assert!(matches!(host.stop(), Err(LifecycleError::NotRunning { .. })));
    }

    #[test]
    fn test_watchers_carry_their_roles() {
        let backend = MockBackend::new();
        let host = host(&backend);
        assert_eq!(host.accessory_watcher().class(), DeviceClass::Accessory);
        assert_eq!(host.switchable_watcher().class(), DeviceClass::Switchable);
    }

    #[test]
    fn test_restart_after_stop() {
        let backend = MockBackend::new();
        let handle = backend.plug(MockDevice::accessory("A"));
        let host = host(&backend);

        host.start().unwrap();
        host.stop().unwrap();
        host.start().unwrap();

        assert_eq!(host.tracked_devices(), vec![handle]);
        assert!(host.echo().is_relaying(handle));
    }

    #[test]
    fn test_second_start_is_rejected() {
        let backend = MockBackend::new();
        let host = host(&backend);

        host.start().unwrap();
        assert!(matches!(
            host.start(),
            Err(LifecycleError::AlreadyRunning { .. })
        ));
        assert!(host.is_running());
    }

    #[test]
    fn test_drop_stops_relays() {
        let backend = MockBackend::new();
        let handle = backend.plug(MockDevice::accessory("A"));

        let host = host(&backend);
        host.start().unwrap();
        let echo = host.echo().clone();
        assert!(echo.is_relaying(handle));

        drop(host);
        assert_eq!(echo.active_workers(), 0);
        assert!(!backend.is_open(handle));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = HostConfig::default();
        config.relay.buffer_size = 64;
        config.watch.accessory = "0x18d1:*".to_string();

        let options = HostOptions::from_config(&config).unwrap();
        assert_eq!(options.relay.buffer_size, 64);
        assert!(options.accessory.matches(VENDOR_ID_GOOGLE, 0x2d00));
        assert!(options.reset_after_negotiation);
    }
}
