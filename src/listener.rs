//! Listener registries and the adapter status listener contract.
//!
//! Listener attachment is identity based: one listener instance (one `Arc`)
//! may be attached at most once to any one registry; re-attachment is a no-op
//! returning `false`. Iteration works on a snapshot, so listeners may add or
//! remove listeners from within a callback without deadlocking.

use std::sync::{Arc, Mutex};

use crate::adapter::{Adapter, AdapterSettings};
use crate::device::Device;
use crate::eir::EirDataType;
use crate::hci::HciStatus;
use crate::smp::{PairingMode, SmpPairingState};
use crate::{DiscoveryPolicy, ScanType};

/// A copy-on-write list of listeners with identity-based attachment.
pub(crate) struct ListenerList<T: ?Sized> {
    items: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> ListenerList<T> {
    pub(crate) fn new() -> Self {
        ListenerList {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Attaches `listener`; returns `false` if this instance is already
    /// attached.
    pub(crate) fn add(&self, listener: Arc<T>) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        items.push(listener);
        true
    }

    /// Detaches `listener`; returns `true` exactly once per attachment.
    pub(crate) fn remove(&self, listener: &Arc<T>) -> bool {
        let mut items = self.items.lock().unwrap();
        match items.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(idx) => {
                items.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Detaches everything, returning the number of removed listeners.
    pub(crate) fn clear(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let count = items.len();
        items.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// The current listener set; safe to iterate while listeners mutate the
    /// registry.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.items.lock().unwrap().clone()
    }
}

impl<T: ?Sized> Default for ListenerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer of one adapter's lifecycle and of every device event below it.
///
/// All callbacks for one adapter are invoked on that adapter's dispatch
/// thread, strictly serialized and in event order. Callbacks across different
/// adapters may run in parallel.
///
/// Except for [`device_ready`][Self::device_ready], callbacks are expected to
/// return promptly; off-load blocking work (and any mutating calls back into
/// the stack) to another thread. A panic escaping a callback is caught and
/// logged; it never terminates the dispatch thread.
#[allow(unused_variables)]
pub trait AdapterStatusListener: Send + Sync {
    /// Adapter settings changed. Upon attachment, one synthetic call with an
    /// empty `old` and `changed` mask but populated `new` mask reports the
    /// current settings without a race.
    fn adapter_settings_changed(
        &self,
        adapter: &Adapter,
        old: AdapterSettings,
        changed: AdapterSettings,
        new: AdapterSettings,
        timestamp: u64,
    ) {
    }

    /// The discovery state of the adapter changed.
    ///
    /// `changed` is the scan type that toggled; `enabled` its new state.
    fn discovering_changed(
        &self,
        adapter: &Adapter,
        current: ScanType,
        changed: ScanType,
        enabled: bool,
        policy: DiscoveryPolicy,
        timestamp: u64,
    ) {
    }

    /// A not yet known remote device was discovered.
    ///
    /// Return `true` to retain the device in the adapter's discovered set, at
    /// which point the caller owns its lifetime until
    /// [`Device::remove`][crate::Device::remove]. If no attached listener
    /// returns `true` the device is discarded.
    fn device_found(&self, device: &Device, timestamp: u64) -> bool {
        false
    }

    /// Advertising data of a discovered device changed; `updated` holds the
    /// merged-in fields.
    fn device_updated(&self, device: &Device, updated: EirDataType, timestamp: u64) {}

    /// An HCI connection to the device is established.
    fn device_connected(&self, device: &Device, discovered: bool, timestamp: u64) {}

    /// The SMP pairing state machine advanced.
    ///
    /// In the expectation states the user must answer via
    /// [`Device::set_pairing_passkey`][crate::Device::set_pairing_passkey] or
    /// [`Device::set_pairing_numeric_comparison`][crate::Device::set_pairing_numeric_comparison],
    /// from another thread.
    fn device_pairing_state(
        &self,
        device: &Device,
        state: SmpPairingState,
        mode: PairingMode,
        timestamp: u64,
    ) {
    }

    /// The device is connected, secured as requested, and usable for GATT.
    ///
    /// This is the only callback that may block.
    fn device_ready(&self, device: &Device, timestamp: u64) {}

    /// The HCI connection is gone.
    fn device_disconnected(
        &self,
        device: &Device,
        reason: HciStatus,
        handle: u16,
        timestamp: u64,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Probe: Send + Sync {}
    struct P;
    impl Probe for P {}

    #[test]
    fn identity_based_attachment() {
        let list: ListenerList<dyn Probe> = ListenerList::new();
        let a: Arc<dyn Probe> = Arc::new(P);
        let b: Arc<dyn Probe> = Arc::new(P);

        assert!(list.add(a.clone()));
        assert!(!list.add(a.clone()));
        assert_eq!(list.len(), 1);

        assert!(list.add(b.clone()));
        assert_eq!(list.len(), 2);

        assert!(list.remove(&a));
        assert!(!list.remove(&a));
        assert_eq!(list.len(), 1);

        assert_eq!(list.clear(), 1);
        assert!(!list.remove(&b));
    }

    #[test]
    fn snapshot_is_detached() {
        let list: ListenerList<dyn Probe> = ListenerList::new();
        let a: Arc<dyn Probe> = Arc::new(P);
        list.add(a.clone());
        let snap = list.snapshot();
        list.clear();
        assert_eq!(snap.len(), 1);
    }
}
