//! Device lifecycle events
//!
//! Watchers raise exactly two kinds of event. Both are delivered through one
//! [`DeviceEventHandler`], together with the registry record they concern, so
//! the handler can record session state, resolved pipes and the relay token.

use crate::registry::DeviceRecord;
use protocol::{DeviceHandle, DeviceIdentity};

/// Lifecycle event raised by a device watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device attached, opened and claimed
    Connected {
        identity: DeviceIdentity,
        handle: DeviceHandle,
    },

    /// Device detached, or its watcher is stopping
    Disconnected { handle: DeviceHandle },
}

impl DeviceEvent {
    pub fn handle(&self) -> DeviceHandle {
        match self {
            DeviceEvent::Connected { handle, .. } | DeviceEvent::Disconnected { handle } => *handle,
        }
    }
}

/// Single dispatch point for device events
///
/// Invoked on the watcher's notification thread while the registry is held,
/// so implementations see events for one handle strictly in order
/// (Connected before Disconnected) and never concurrently.
pub trait DeviceEventHandler: Send + Sync {
    fn handle_event(&self, event: &DeviceEvent, record: &mut DeviceRecord);
}
