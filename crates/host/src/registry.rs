//! Device registry
//!
//! Maps backend device handles to tracked device records. At most one record
//! exists per handle; a handle present here refers to a device the backend
//! currently holds open (unless the record says it was released early).

use protocol::{DeviceClass, DeviceHandle, DeviceIdentity, EndpointPair, SessionState};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-device tracking record
#[derive(Debug)]
pub struct DeviceRecord {
    pub handle: DeviceHandle,
    pub identity: DeviceIdentity,
    /// Role of the watcher that picked the device up
    pub class: DeviceClass,
    /// Interface claimed when the device was opened
    pub interface: u8,
    state: SessionState,
    /// Bulk pipe pair, once resolved
    pub endpoints: Option<EndpointPair>,
    /// Cancellation token of the echo worker bound to this handle
    pub worker: Option<CancellationToken>,
    /// False once the device has been closed ahead of its disconnect
    pub open: bool,
}

impl DeviceRecord {
    pub fn new(
        handle: DeviceHandle,
        identity: DeviceIdentity,
        class: DeviceClass,
        interface: u8,
    ) -> Self {
        Self {
            handle,
            identity,
            class,
            interface,
            state: SessionState::Discovered,
            endpoints: None,
            worker: None,
            open: true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next` if the transition is legal
    ///
    /// Illegal transitions are logged and leave the state unchanged.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Ignoring illegal session transition {} -> {} for {} ({})",
                self.state, next, self.identity, self.handle
            );
            return false;
        }
        self.state = next;
        true
    }
}

/// Error returned when inserting a handle that is already tracked
#[derive(Debug, PartialEq, Eq)]
pub struct DuplicateHandle(pub DeviceHandle);

/// Handle -> record map
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: HashMap<DeviceHandle, DeviceRecord>,
    /// Evicted while the device was still attached
    retired: HashSet<DeviceHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new record; refuses a handle that is already present
    pub fn insert(&mut self, record: DeviceRecord) -> Result<&mut DeviceRecord, DuplicateHandle> {
        use std::collections::hash_map::Entry;

        match self.records.entry(record.handle) {
            Entry::Occupied(_) => Err(DuplicateHandle(record.handle)),
            Entry::Vacant(slot) => Ok(slot.insert(record)),
        }
    }

    pub fn remove(&mut self, handle: DeviceHandle) -> Option<DeviceRecord> {
        self.records.remove(&handle)
    }

    /// Evict the record of a device that is still attached
    ///
    /// The handle is remembered so its eventual departure can be told apart
    /// from a departure of a device that was never tracked.
    pub fn retire(&mut self, handle: DeviceHandle) -> Option<DeviceRecord> {
        let record = self.records.remove(&handle)?;
        self.retired.insert(handle);
        Some(record)
    }

    /// Forget a retired handle; false if it was never retired
    pub fn forget_retired(&mut self, handle: DeviceHandle) -> bool {
        self.retired.remove(&handle)
    }

    pub fn is_retired(&self, handle: DeviceHandle) -> bool {
        self.retired.contains(&handle)
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&DeviceRecord> {
        self.records.get(&handle)
    }

    pub fn get_mut(&mut self, handle: DeviceHandle) -> Option<&mut DeviceRecord> {
        self.records.get_mut(&handle)
    }

    pub fn contains(&self, handle: DeviceHandle) -> bool {
        self.records.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Tracked handles in ascending order
    pub fn handles(&self) -> Vec<DeviceHandle> {
        let mut handles: Vec<DeviceHandle> = self.records.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Remove and return every record, ordered by handle
    ///
    /// Retired handles are forgotten as well.
    pub fn drain(&mut self) -> Vec<DeviceRecord> {
        self.retired.clear();
        let mut records: Vec<DeviceRecord> = self.records.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.handle);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::accessory_identity;

    fn record(id: u64) -> DeviceRecord {
        DeviceRecord::new(
            DeviceHandle(id),
            accessory_identity("SN"),
            DeviceClass::Accessory,
            0,
        )
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let mut registry = DeviceRegistry::new();
        registry.insert(record(1)).unwrap();

        let err = registry.insert(record(1)).unwrap_err();
        assert_eq!(err, DuplicateHandle(DeviceHandle(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_drain() {
        let mut registry = DeviceRegistry::new();
        for id in [3, 1, 2] {
            registry.insert(record(id)).unwrap();
        }
        assert_eq!(
            registry.handles(),
            vec![DeviceHandle(1), DeviceHandle(2), DeviceHandle(3)]
        );

        assert!(registry.remove(DeviceHandle(2)).is_some());
        assert!(registry.remove(DeviceHandle(2)).is_none());

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].handle, DeviceHandle(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retire_remembers_handle_until_forgotten() {
        let mut registry = DeviceRegistry::new();
        registry.insert(record(1)).unwrap();
        registry.insert(record(2)).unwrap();

        assert!(registry.retire(DeviceHandle(1)).is_some());
        assert!(registry.retire(DeviceHandle(3)).is_none());
        assert!(!registry.contains(DeviceHandle(1)));
        assert!(registry.is_retired(DeviceHandle(1)));
        assert!(!registry.is_retired(DeviceHandle(3)));

        assert!(registry.forget_retired(DeviceHandle(1)));
        assert!(!registry.forget_retired(DeviceHandle(1)));

        registry.retire(DeviceHandle(2));
        registry.drain();
        assert!(!registry.is_retired(DeviceHandle(2)));
    }

    #[test]
    fn test_record_advance() {
        let mut record = record(1);
        assert_eq!(record.state(), SessionState::Discovered);

        assert!(record.advance(SessionState::AccessoryActive));
        assert!(!record.advance(SessionState::Negotiating));
        assert_eq!(record.state(), SessionState::AccessoryActive);

        assert!(record.advance(SessionState::Relaying));
        assert!(record.advance(SessionState::Disconnected));
        assert!(!record.advance(SessionState::Disconnected));
    }
}
