//! Client-side view of a remote peer's GATT database.
//!
//! The tree is discovered once per connection by
//! [`Device::gatt_services`][crate::Device::gatt_services] and cached.
//! Characteristic value change listeners are registered against one
//! characteristic or device-wide; registering a listener does not by itself
//! write the peer's CCCD — use
//! [`GattCharacteristic::config_notification_indication`] or
//! [`GattCharacteristic::enable_notification_or_indication`].

use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::btuuid;
use crate::device::{Device, DeviceInner};
use crate::error::ErrorKind;
use crate::hci::{GattCharDef, GattServiceDef};
use crate::{CharacteristicProperties, Result};

/// A descriptor of a remote characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    /// The attribute handle on the remote server.
    pub handle: u16,
    /// The descriptor type.
    pub uuid: Uuid,
}

impl GattDescriptor {
    /// Whether this is the Client Characteristic Configuration descriptor.
    pub fn is_cccd(&self) -> bool {
        self.uuid == btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION
    }
}

/// A characteristic of a remote service.
#[derive(Debug, Clone)]
pub struct GattCharacteristic {
    pub(crate) device: Weak<DeviceInner>,
    /// The type of the service this characteristic belongs to.
    pub service_uuid: Uuid,
    /// The characteristic declaration handle.
    pub handle: u16,
    /// The characteristic value handle.
    pub value_handle: u16,
    /// The characteristic type.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
    /// Descriptors in declaration order.
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    fn device(&self) -> Result<Device> {
        Device::upgrade(&self.device).ok_or_else(|| ErrorKind::InvalidHandle.into())
    }

    /// The Client Characteristic Configuration descriptor, if present.
    pub fn client_char_config(&self) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.is_cccd())
    }

    /// Reads the characteristic value from the peer.
    pub fn read_value(&self) -> Result<Vec<u8>> {
        self.device()?.att_read(self.value_handle)
    }

    /// Writes the characteristic value, with or without response.
    pub fn write_value(&self, value: &[u8], with_response: bool) -> Result<()> {
        self.device()?
            .att_write(self.value_handle, value, with_response)
    }

    /// Writes the peer's CCCD to the requested notification/indication
    /// state.
    ///
    /// Requested bits unsupported by the characteristic's properties are
    /// masked off. Returns `false` without a write when the characteristic
    /// has no CCCD; `enabled_state` always reports the post-operation
    /// `[notify, indicate]` bits.
    pub fn config_notification_indication(
        &self,
        enable_notify: bool,
        enable_indicate: bool,
        enabled_state: &mut [bool; 2],
    ) -> Result<bool> {
        let notify = enable_notify && self.properties.contains(CharacteristicProperties::NOTIFY);
        let indicate =
            enable_indicate && self.properties.contains(CharacteristicProperties::INDICATE);
        let cccd = match self.client_char_config() {
            Some(cccd) => cccd,
            None => {
                *enabled_state = [false, false];
                return Ok(false);
            }
        };
        let value = u16::from(notify) | (u16::from(indicate) << 1);
        self.device()?
            .att_write(cccd.handle, &value.to_le_bytes(), true)?;
        *enabled_state = [notify, indicate];
        Ok(true)
    }

    /// Enables notifications if supported, otherwise indications.
    pub fn enable_notification_or_indication(
        &self,
        enabled_state: &mut [bool; 2],
    ) -> Result<bool> {
        let notify = self.properties.contains(CharacteristicProperties::NOTIFY);
        let indicate = self.properties.contains(CharacteristicProperties::INDICATE);
        self.config_notification_indication(notify, !notify && indicate, enabled_state)
    }

    /// Disables both notifications and indications.
    pub fn disable_notification_indication(&self) -> Result<bool> {
        let mut state = [false, false];
        self.config_notification_indication(false, false, &mut state)
    }

    /// Attaches a value change listener scoped to this characteristic.
    ///
    /// Identity based; returns `false` if this instance is already attached
    /// to the device.
    pub fn add_listener(&self, listener: Arc<dyn GattCharListener>) -> Result<bool> {
        Ok(self
            .device()?
            .add_char_listener_for(listener, Some(self.value_handle)))
    }

    /// Detaches a value change listener.
    pub fn remove_listener(&self, listener: &Arc<dyn GattCharListener>) -> Result<bool> {
        Ok(self.device()?.remove_char_listener(listener))
    }
}

/// A service of a remote peer.
#[derive(Debug, Clone)]
pub struct GattService {
    /// First handle covered by the service.
    pub start_handle: u16,
    /// Last handle covered by the service.
    pub end_handle: u16,
    /// Primary or included-only service.
    pub primary: bool,
    /// The service type.
    pub uuid: Uuid,
    /// Characteristics in declaration order.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Finds a characteristic by type.
    pub fn find_char(&self, char_uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == char_uuid)
    }

    pub(crate) fn from_defs(
        device: &Weak<DeviceInner>,
        defs: Vec<GattServiceDef>,
    ) -> Vec<GattService> {
        defs.into_iter()
            .map(|def| GattService {
                start_handle: def.start_handle,
                end_handle: def.end_handle,
                primary: def.primary,
                uuid: def.uuid,
                characteristics: def
                    .characteristics
                    .into_iter()
                    .map(|c| Self::char_from_def(device, def.uuid, c))
                    .collect(),
            })
            .collect()
    }

    fn char_from_def(
        device: &Weak<DeviceInner>,
        service_uuid: Uuid,
        def: GattCharDef,
    ) -> GattCharacteristic {
        GattCharacteristic {
            device: device.clone(),
            service_uuid,
            handle: def.handle,
            value_handle: def.value_handle,
            uuid: def.uuid,
            properties: CharacteristicProperties::from_declaration(def.properties),
            descriptors: def
                .descriptors
                .into_iter()
                .map(|d| GattDescriptor {
                    handle: d.handle,
                    uuid: d.uuid,
                })
                .collect(),
        }
    }
}

/// Observer of characteristic value changes pushed by a remote peer.
///
/// Dispatched on the owning adapter's dispatch thread, serialized with all
/// other callbacks of that adapter.
#[allow(unused_variables)]
pub trait GattCharListener: Send + Sync {
    /// The peer sent an unconfirmed value notification.
    fn notification_received(
        &self,
        characteristic: &GattCharacteristic,
        value: &[u8],
        timestamp: u64,
    ) {
    }

    /// The peer sent a value indication. `confirmation_sent` reports whether
    /// the ATT layer already acknowledged it.
    fn indication_received(
        &self,
        characteristic: &GattCharacteristic,
        value: &[u8],
        timestamp: u64,
        confirmation_sent: bool,
    ) {
    }
}

/// Registry of [`GattCharListener`]s with an optional per-entry value-handle
/// filter. Identity based like
/// [`ListenerList`][crate::listener::ListenerList].
pub(crate) struct CharListenerRegistry {
    entries: Mutex<Vec<(Arc<dyn GattCharListener>, Option<u16>)>>,
}

impl CharListenerRegistry {
    pub(crate) fn new() -> Self {
        CharListenerRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn GattCharListener>, filter: Option<u16>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|(l, _)| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        entries.push((listener, filter));
        true
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn GattCharListener>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|(l, _)| Arc::ptr_eq(l, listener)) {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let count = entries.len();
        entries.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Listeners whose filter matches `value_handle`.
    pub(crate) fn matching(&self, value_handle: u16) -> Vec<Arc<dyn GattCharListener>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, filter)| filter.is_none() || *filter == Some(value_handle))
            .map(|(l, _)| l.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;
    impl GattCharListener for Probe {}

    #[test]
    fn registry_identity_and_filtering() {
        let registry = CharListenerRegistry::new();
        let wide: Arc<dyn GattCharListener> = Arc::new(Probe);
        let scoped: Arc<dyn GattCharListener> = Arc::new(Probe);

        assert!(registry.add(wide.clone(), None));
        assert!(!registry.add(wide.clone(), Some(0x10)));
        assert!(registry.add(scoped.clone(), Some(0x10)));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.matching(0x10).len(), 2);
        assert_eq!(registry.matching(0x33).len(), 1);

        assert!(registry.remove(&wide));
        assert!(!registry.remove(&wide));
        assert_eq!(registry.clear(), 1);
    }
}
