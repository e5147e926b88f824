//! libusb event pump
//!
//! Dedicated thread that runs `libusb_handle_events()` so hotplug callbacks
//! get delivered. The loop polls for a shutdown command between 100 ms event
//! waits.

use common::{NoticeReceiver, NoticeSender, PumpCommand, create_notice_channel};
use rusb::{Context, UsbContext};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Event wait per loop iteration
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Handle to the running pump thread
pub struct EventPump {
    commands: NoticeSender<PumpCommand>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Spawn the pump thread for `context`
    pub fn spawn(context: Context) -> std::io::Result<Self> {
        let (commands, receiver) = create_notice_channel(4);

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run(context, receiver))?;

        Ok(Self {
            commands,
            thread: Some(thread),
        })
    }

    /// Ask the pump to exit and wait for it
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        if let Err(e) = self.commands.send_blocking(PumpCommand::Shutdown) {
            debug!("Pump already gone: {}", e);
        }
        if thread.join().is_err() {
            error!("USB event pump panicked");
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(context: Context, commands: NoticeReceiver<PumpCommand>) {
    info!("USB event pump started");

    loop {
        match commands.try_recv() {
            Ok(Some(PumpCommand::Shutdown)) | Err(_) => {
                info!("USB event pump shutting down");
                break;
            }
            Ok(None) => {}
        }

        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }

    info!("USB event pump stopped");
}
