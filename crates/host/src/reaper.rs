//! Relay reaper
//!
//! Drains the echo bridge's notice channel on its own thread. A failed relay
//! is handed to whichever watcher tracks the handle, which takes the device
//! through Disconnected and evicts it.

use crate::echo::{EchoBridge, RelayNotice};
use crate::watcher::DeviceWatcher;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct RelayReaper {
    echo: Arc<EchoBridge>,
    thread: Option<JoinHandle<usize>>,
}

impl RelayReaper {
    /// Spawn the reaper thread for `watchers`
    pub fn spawn(
        echo: Arc<EchoBridge>,
        watchers: Vec<Arc<DeviceWatcher>>,
    ) -> std::io::Result<Self> {
        let notices = echo.notices();

        let thread = std::thread::Builder::new()
            .name("relay-reaper".to_string())
            .spawn(move || {
                let mut retired = 0;

                while let Ok(notice) = notices.recv_blocking() {
                    match notice {
                        RelayNotice::Failed { handle, exit } => {
                            if watchers.iter().any(|w| w.retire(handle)) {
                                retired += 1;
                            } else {
                                debug!("Relay of {} ended ({:?}) after it left", handle, exit);
                            }
                        }
                        RelayNotice::Shutdown => break,
                    }
                }

                retired
            })?;

        Ok(Self {
            echo,
            thread: Some(thread),
        })
    }

    /// Ask the thread to exit and wait for it
    ///
    /// Failures already queued are handled first. Returns the number of
    /// devices retired over the reaper's lifetime.
    pub fn shutdown(mut self) -> usize {
        self.join()
    }

    fn join(&mut self) -> usize {
        let Some(thread) = self.thread.take() else {
            return 0;
        };

        if let Err(e) = self.echo.notify(RelayNotice::Shutdown) {
            warn!("Could not signal relay reaper: {}", e);
            return 0;
        }

        match thread.join() {
            Ok(retired) => {
                info!("Relay reaper stopped after retiring {} devices", retired);
                retired
            }
            Err(e) => {
                error!("Relay reaper panicked: {:?}", e);
                0
            }
        }
    }
}

impl Drop for RelayReaper {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::{RelayConfig, RelayExit};
    use crate::events::{DeviceEvent, DeviceEventHandler};
    use crate::registry::DeviceRecord;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, MockBackend, MockDevice, TEST_IO_TIMEOUT, wait_until,
    };
    use protocol::{DeviceClass, DeviceHandle, UsbError};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<DeviceEvent>>,
    }

    impl DeviceEventHandler for Recorder {
        fn handle_event(&self, event: &DeviceEvent, _record: &mut DeviceRecord) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn bridge(backend: &MockBackend) -> Arc<EchoBridge> {
        Arc::new(EchoBridge::new(
            Arc::new(backend.clone()),
            RelayConfig {
                io_timeout: TEST_IO_TIMEOUT,
                buffer_size: 512,
            },
        ))
    }

    #[test]
    fn test_failure_retires_device_on_tracking_watcher() {
        let backend = MockBackend::new();
        let echo = bridge(&backend);
        let recorder = Arc::new(Recorder::default());
        let watcher = Arc::new(DeviceWatcher::new(
            "accessory watcher",
            "*:*".parse().unwrap(),
            DeviceClass::Accessory,
            Arc::new(backend.clone()),
            recorder.clone(),
        ));
        watcher.start().unwrap();
        let handle = backend.plug(MockDevice::accessory("A"));

        let reaper = RelayReaper::spawn(echo.clone(), vec![watcher.clone()]).unwrap();
        echo.notify(RelayNotice::Failed {
            handle,
            exit: RelayExit::ReadFailed(UsbError::Io),
        })
        .unwrap();
        echo.notify(RelayNotice::Failed {
            handle: DeviceHandle(999),
            exit: RelayExit::ReadFailed(UsbError::Io),
        })
        .unwrap();

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            watcher.tracked_devices().is_empty()
        }));
        assert_eq!(reaper.shutdown(), 1);
        assert!(!backend.is_open(handle));
        assert_eq!(
            recorder.events.lock().unwrap().last(),
            Some(&DeviceEvent::Disconnected { handle })
        );
    }

    #[test]
    fn test_shutdown_without_failures() {
        let backend = MockBackend::new();
        let reaper = RelayReaper::spawn(bridge(&backend), Vec::new()).unwrap();
        assert_eq!(reaper.shutdown(), 0);
    }
}
