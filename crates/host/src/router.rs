//! Event router
//!
//! Single dispatch point behind both device watchers. A switchable device is
//! negotiated into accessory mode and released; an accessory-mode device gets
//! its bulk pipes resolved and an echo worker started. Disconnects stop the
//! worker bound to the handle and nothing else.

use crate::echo::EchoBridge;
use crate::endpoints::resolve_endpoints;
use crate::events::{DeviceEvent, DeviceEventHandler};
use crate::negotiator::AccessoryNegotiator;
use crate::registry::DeviceRecord;
use common::UsbBackend;
use protocol::{DeviceClass, SessionState};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct EventRouter {
    backend: Arc<dyn UsbBackend>,
    negotiator: AccessoryNegotiator,
    echo: Arc<EchoBridge>,
    /// Reset and close a switchable device once negotiation finishes
    reset_after_negotiation: bool,
}

impl EventRouter {
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        negotiator: AccessoryNegotiator,
        echo: Arc<EchoBridge>,
        reset_after_negotiation: bool,
    ) -> Self {
        Self {
            backend,
            negotiator,
            echo,
            reset_after_negotiation,
        }
    }

    pub fn echo(&self) -> &Arc<EchoBridge> {
        &self.echo
    }

    fn on_connected(&self, record: &mut DeviceRecord) {
        match record.class {
            DeviceClass::Accessory => self.start_relay(record),
            DeviceClass::Switchable => self.switch_to_accessory(record),
        }
    }

    fn switch_to_accessory(&self, record: &mut DeviceRecord) {
        record.advance(SessionState::Negotiating);

        if self.negotiator.negotiate(record.handle, &record.identity) {
            record.advance(SessionState::AccessoryActive);
        } else {
            record.advance(SessionState::Unsupported);
        }

        if !self.reset_after_negotiation {
            return;
        }

        // The device re-enumerates under a new handle either way
        if let Err(e) = self.backend.reset(record.handle) {
            debug!(
                "Reset of {} ({}) failed: {}",
                record.identity, record.handle, e
            );
        }
        self.backend.close(record.handle);
        record.open = false;
    }

    fn start_relay(&self, record: &mut DeviceRecord) {
        record.advance(SessionState::AccessoryActive);

        let endpoints = match resolve_endpoints(self.backend.as_ref(), record.handle) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(
                    "Could not resolve pipes for {} ({}): {}",
                    record.identity, record.handle, e
                );
                return;
            }
        };
        record.endpoints = Some(endpoints);

        match self
            .echo
            .start(record.handle, record.identity.clone(), endpoints)
        {
            Ok(token) => {
                record.worker = Some(token);
                record.advance(SessionState::Relaying);
            }
            Err(e) => error!(
                "Failed to start echo for {} ({}): {}",
                record.identity, record.handle, e
            ),
        }
    }

    fn on_disconnected(&self, record: &mut DeviceRecord) {
        if let Some(token) = record.worker.take() {
            token.cancel();
            match self.echo.stop(record.handle) {
                Some(report) if report.exit.is_fatal() => warn!(
                    "{} relay ended with {:?} after {} bytes",
                    record.identity, report.exit, report.bytes_relayed
                ),
                Some(report) => info!(
                    "{} disconnected after relaying {} bytes",
                    record.identity, report.bytes_relayed
                ),
                None => warn!(
                    "{} ({}) had a token but no registered echo worker",
                    record.identity, record.handle
                ),
            }
        }

        record.advance(SessionState::Disconnected);
        info!("Device disconnected: {} ({})", record.identity, record.handle);
    }
}

impl DeviceEventHandler for EventRouter {
    fn handle_event(&self, event: &DeviceEvent, record: &mut DeviceRecord) {
        match event {
            DeviceEvent::Connected { identity, handle } => {
                info!("Device connected: {} ({})", identity, handle);
                self.on_connected(record);
            }
            DeviceEvent::Disconnected { .. } => self.on_disconnected(record),
        }
    }
}
