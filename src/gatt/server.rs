//! The local GATT server database exposed while advertising.
//!
//! A [`DbGattServer`] is built mutably, then frozen when handed to
//! [`Adapter::start_advertising`][crate::Adapter::start_advertising]: handles
//! are assigned depth-first and the structure becomes immutable. Only
//! characteristic and descriptor *values* mutate afterwards.

use std::fmt;
use std::sync::Mutex;

use uuid::Uuid;

use crate::btuuid;
use crate::device::Device;
use crate::listener::ListenerList;
use crate::CharacteristicProperties;

/// Default maximum ATT MTU offered by the server.
pub const DEFAULT_MAX_ATT_MTU: u16 = 513;

/// A GATT descriptor of the local server.
#[derive(Debug)]
pub struct DbGattDesc {
    handle: u16,
    /// The descriptor type.
    pub uuid: Uuid,
    value: Mutex<Vec<u8>>,
    variable_length: bool,
}

impl DbGattDesc {
    /// Creates a descriptor.
    ///
    /// Client-Characteristic-Configuration and Extended-Properties
    /// descriptors are always fixed-length, regardless of `variable_length`.
    pub fn new(uuid: Uuid, value: impl Into<Vec<u8>>, variable_length: bool) -> Self {
        let forced_fixed = uuid == btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION
            || uuid == btuuid::descriptors::CHARACTERISTIC_EXTENDED_PROPERTIES;
        DbGattDesc {
            handle: 0,
            uuid,
            value: Mutex::new(value.into()),
            variable_length: variable_length && !forced_fixed,
        }
    }

    /// Creates a zeroed Client Characteristic Configuration descriptor.
    pub fn cccd() -> Self {
        Self::new(
            btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION,
            vec![0, 0],
            false,
        )
    }

    /// Creates a Characteristic User Description descriptor.
    pub fn user_description(text: &str) -> Self {
        Self::new(
            btuuid::descriptors::CHARACTERISTIC_USER_DESCRIPTION,
            text.as_bytes().to_vec(),
            false,
        )
    }

    /// The assigned attribute handle; zero before the database is frozen.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Whether writes may change the value length.
    pub fn variable_length(&self) -> bool {
        self.variable_length
    }

    /// A copy of the current value.
    pub fn value(&self) -> Vec<u8> {
        self.value.lock().unwrap().clone()
    }

    /// Replaces the value at `offset`.
    ///
    /// A fixed-length descriptor rejects writes that would change its length.
    pub fn write_value(&self, data: &[u8], offset: usize) -> bool {
        let mut value = self.value.lock().unwrap();
        let end = offset + data.len();
        if end > value.len() {
            if !self.variable_length {
                return false;
            }
            value.resize(end, 0);
        }
        value[offset..end].copy_from_slice(data);
        true
    }

    /// Whether this is the Client Characteristic Configuration descriptor.
    pub fn is_cccd(&self) -> bool {
        self.uuid == btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION
    }
}

/// A GATT characteristic of the local server with its descriptors.
#[derive(Debug)]
pub struct DbGattChar {
    handle: u16,
    value_handle: u16,
    /// The characteristic type.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
    value: Mutex<Vec<u8>>,
    variable_length: bool,
    descriptors: Vec<DbGattDesc>,
}

impl DbGattChar {
    /// Creates a characteristic with its descriptors.
    pub fn new(
        uuid: Uuid,
        properties: CharacteristicProperties,
        descriptors: Vec<DbGattDesc>,
        value: impl Into<Vec<u8>>,
        variable_length: bool,
    ) -> Self {
        DbGattChar {
            handle: 0,
            value_handle: 0,
            uuid,
            properties,
            value: Mutex::new(value.into()),
            variable_length,
            descriptors,
        }
    }

    /// The characteristic declaration handle; zero before freezing.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// The characteristic value handle; zero before freezing.
    pub fn value_handle(&self) -> u16 {
        self.value_handle
    }

    /// Whether writes may change the value length.
    pub fn variable_length(&self) -> bool {
        self.variable_length
    }

    /// The descriptors in declaration order.
    pub fn descriptors(&self) -> &[DbGattDesc] {
        &self.descriptors
    }

    /// The Client Characteristic Configuration descriptor, if declared.
    pub fn client_char_config(&self) -> Option<&DbGattDesc> {
        self.descriptors.iter().find(|d| d.is_cccd())
    }

    /// A copy of the current value.
    pub fn value(&self) -> Vec<u8> {
        self.value.lock().unwrap().clone()
    }

    /// Replaces the value at `offset`; see [`DbGattDesc::write_value`].
    pub fn write_value(&self, data: &[u8], offset: usize) -> bool {
        let mut value = self.value.lock().unwrap();
        let end = offset + data.len();
        if end > value.len() {
            if !self.variable_length {
                return false;
            }
            value.resize(end, 0);
        }
        value[offset..end].copy_from_slice(data);
        true
    }
}

/// A GATT service of the local server with its characteristics.
#[derive(Debug)]
pub struct DbGattService {
    handle: u16,
    end_handle: u16,
    /// The service type.
    pub uuid: Uuid,
    /// Primary services are discoverable directly; secondary services only
    /// through an include.
    pub primary: bool,
    characteristics: Vec<DbGattChar>,
}

impl DbGattService {
    /// Creates a service with its characteristics.
    pub fn new(primary: bool, uuid: Uuid, characteristics: Vec<DbGattChar>) -> Self {
        DbGattService {
            handle: 0,
            end_handle: 0,
            uuid,
            primary,
            characteristics,
        }
    }

    /// The service start handle; zero before freezing.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// The last handle covered by this service; zero before freezing.
    pub fn end_handle(&self) -> u16 {
        self.end_handle
    }

    /// The characteristics in declaration order.
    pub fn characteristics(&self) -> &[DbGattChar] {
        &self.characteristics
    }

    /// Finds a characteristic by type.
    pub fn find_char(&self, char_uuid: Uuid) -> Option<&DbGattChar> {
        self.characteristics.iter().find(|c| c.uuid == char_uuid)
    }
}

/// The ordered GATT database a peripheral serves, plus its listener registry.
pub struct DbGattServer {
    services: Vec<DbGattService>,
    max_att_mtu: u16,
    handles_assigned: bool,
    listeners: ListenerList<dyn DbGattServerListener>,
}

impl fmt::Debug for DbGattServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbGattServer")
            .field("services", &self.services)
            .field("max_att_mtu", &self.max_att_mtu)
            .field("handles_assigned", &self.handles_assigned)
            .finish()
    }
}

impl Default for DbGattServer {
    fn default() -> Self {
        Self::new()
    }
}

impl DbGattServer {
    /// Creates an empty database with the default maximum ATT MTU.
    pub fn new() -> Self {
        DbGattServer {
            services: Vec::new(),
            max_att_mtu: DEFAULT_MAX_ATT_MTU,
            handles_assigned: false,
            listeners: ListenerList::new(),
        }
    }

    /// The maximum ATT MTU this server accepts.
    pub fn max_att_mtu(&self) -> u16 {
        self.max_att_mtu
    }

    /// Lowers or restores the maximum ATT MTU (clamped to 23..=513).
    pub fn set_max_att_mtu(&mut self, mtu: u16) {
        self.max_att_mtu = mtu.clamp(23, DEFAULT_MAX_ATT_MTU);
    }

    /// Appends a service.
    ///
    /// Returns `false` once the database has been frozen by
    /// [`Adapter::start_advertising`][crate::Adapter::start_advertising].
    pub fn add_service(&mut self, service: DbGattService) -> bool {
        if self.handles_assigned {
            return false;
        }
        self.services.push(service);
        true
    }

    /// The services in declaration order.
    pub fn services(&self) -> &[DbGattService] {
        &self.services
    }

    /// Whether handles have been assigned and the structure is frozen.
    pub fn handles_assigned(&self) -> bool {
        self.handles_assigned
    }

    /// Assigns attribute handles depth-first: service start handle, per
    /// characteristic its declaration and value handle, then each descriptor;
    /// the service end handle covers the last assigned handle.
    pub(crate) fn assign_handles(&mut self, start: u16) {
        let mut next = start;
        for service in &mut self.services {
            service.handle = next;
            next += 1;
            for characteristic in &mut service.characteristics {
                characteristic.handle = next;
                characteristic.value_handle = next + 1;
                next += 2;
                for descriptor in &mut characteristic.descriptors {
                    descriptor.handle = next;
                    next += 1;
                }
            }
            service.end_handle = next - 1;
        }
        self.handles_assigned = true;
    }

    /// Finds a service by type.
    pub fn find_service(&self, service_uuid: Uuid) -> Option<&DbGattService> {
        self.services.iter().find(|s| s.uuid == service_uuid)
    }

    /// Finds a characteristic within a specific service.
    pub fn find_char(&self, service_uuid: Uuid, char_uuid: Uuid) -> Option<&DbGattChar> {
        self.find_service(service_uuid)?.find_char(char_uuid)
    }

    /// Finds a characteristic by type across all services.
    pub fn find_char_by_uuid(&self, char_uuid: Uuid) -> Option<&DbGattChar> {
        self.services.iter().find_map(|s| s.find_char(char_uuid))
    }

    /// Finds the characteristic owning `value_handle`, with its service.
    pub fn find_char_by_value_handle(
        &self,
        value_handle: u16,
    ) -> Option<(&DbGattService, &DbGattChar)> {
        self.services.iter().find_map(|s| {
            s.characteristics
                .iter()
                .find(|c| c.value_handle == value_handle)
                .map(|c| (s, c))
        })
    }

    /// Finds the descriptor with `handle`, with its service and
    /// characteristic.
    pub fn find_desc_by_handle(
        &self,
        handle: u16,
    ) -> Option<(&DbGattService, &DbGattChar, &DbGattDesc)> {
        self.services.iter().find_map(|s| {
            s.characteristics.iter().find_map(|c| {
                c.descriptors
                    .iter()
                    .find(|d| d.handle == handle)
                    .map(|d| (s, c, d))
            })
        })
    }

    /// Locates the canonical Client Characteristic Configuration descriptor.
    pub fn find_client_char_config(
        &self,
        service_uuid: Uuid,
        char_uuid: Uuid,
    ) -> Option<&DbGattDesc> {
        self.find_char(service_uuid, char_uuid)?.client_char_config()
    }

    /// Zeroes the Client Characteristic Configuration descriptor value.
    pub fn reset_client_char_config(&self, service_uuid: Uuid, char_uuid: Uuid) -> bool {
        match self.find_client_char_config(service_uuid, char_uuid) {
            Some(desc) => desc.write_value(&[0, 0], 0),
            None => false,
        }
    }

    /// Attaches `listener`; identity based, `false` if already attached.
    pub fn add_listener(&self, listener: std::sync::Arc<dyn DbGattServerListener>) -> bool {
        self.listeners.add(listener)
    }

    /// Detaches `listener`.
    pub fn remove_listener(&self, listener: &std::sync::Arc<dyn DbGattServerListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn fan_connected(&self, device: &Device, initial_mtu: u16) {
        for listener in self.listeners.snapshot() {
            listener.connected(device, initial_mtu);
        }
    }

    pub(crate) fn fan_disconnected(&self, device: &Device) {
        for listener in self.listeners.snapshot() {
            listener.disconnected(device);
        }
    }

    pub(crate) fn fan_mtu_changed(&self, device: &Device, mtu: u16) {
        for listener in self.listeners.snapshot() {
            listener.mtu_changed(device, mtu);
        }
    }

    /// Unanimous-accept vote on reading a characteristic value.
    pub fn authorize_read_char(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
    ) -> bool {
        self.listeners
            .snapshot()
            .iter()
            .all(|l| l.read_char_value(device, service, characteristic))
    }

    /// Unanimous-accept vote on reading a descriptor value.
    pub fn authorize_read_desc(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
    ) -> bool {
        self.listeners
            .snapshot()
            .iter()
            .all(|l| l.read_desc_value(device, service, characteristic, descriptor))
    }

    /// Unanimous-accept vote on writing a characteristic value.
    pub fn authorize_write_char(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        value: &[u8],
        offset: u16,
    ) -> bool {
        self.listeners
            .snapshot()
            .iter()
            .all(|l| l.write_char_value(device, service, characteristic, value, offset))
    }

    /// Unanimous-accept vote on writing a descriptor value.
    pub fn authorize_write_desc(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
        value: &[u8],
        offset: u16,
    ) -> bool {
        self.listeners
            .snapshot()
            .iter()
            .all(|l| l.write_desc_value(device, service, characteristic, descriptor, value, offset))
    }

    pub(crate) fn fan_write_char_done(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
    ) {
        for listener in self.listeners.snapshot() {
            listener.write_char_value_done(device, service, characteristic);
        }
    }

    pub(crate) fn fan_write_desc_done(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
    ) {
        for listener in self.listeners.snapshot() {
            listener.write_desc_value_done(device, service, characteristic, descriptor);
        }
    }

    pub(crate) fn fan_cccd_changed(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
        notify: bool,
        indicate: bool,
    ) {
        for listener in self.listeners.snapshot() {
            listener.client_char_config_changed(
                device,
                service,
                characteristic,
                descriptor,
                notify,
                indicate,
            );
        }
    }
}

/// Callbacks invoked by the ATT server layer for one [`DbGattServer`].
///
/// The `read_*`/`write_*` methods are authorization votes: the operation is
/// permitted only if every attached listener returns `true`. Defaults accept.
#[allow(unused_variables)]
pub trait DbGattServerListener: Send + Sync {
    /// A client connected; `initial_mtu` is the pre-exchange default.
    fn connected(&self, device: &Device, initial_mtu: u16) {}

    /// A client disconnected.
    fn disconnected(&self, device: &Device) {}

    /// The ATT MTU for a client changed after an exchange.
    fn mtu_changed(&self, device: &Device, mtu: u16) {}

    /// Vote on a characteristic value read.
    fn read_char_value(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
    ) -> bool {
        true
    }

    /// Vote on a descriptor value read.
    fn read_desc_value(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
    ) -> bool {
        true
    }

    /// Vote on a characteristic value write.
    fn write_char_value(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        value: &[u8],
        offset: u16,
    ) -> bool {
        true
    }

    /// An accepted characteristic write has been applied, including the end
    /// of a prepared-write sequence.
    fn write_char_value_done(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
    ) {
    }

    /// Vote on a descriptor value write.
    fn write_desc_value(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
        value: &[u8],
        offset: u16,
    ) -> bool {
        true
    }

    /// An accepted descriptor write has been applied.
    fn write_desc_value_done(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
    ) {
    }

    /// A client toggled notifications or indications via the CCCD.
    fn client_char_config_changed(
        &self,
        device: &Device,
        service: &DbGattService,
        characteristic: &DbGattChar,
        descriptor: &DbGattDesc,
        notify: bool,
        indicate: bool,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid;

    fn props(read: bool, write: bool, notify: bool) -> CharacteristicProperties {
        let mut props = CharacteristicProperties::empty();
        if read {
            props |= CharacteristicProperties::READ;
        }
        if write {
            props |= CharacteristicProperties::WRITE;
        }
        if notify {
            props |= CharacteristicProperties::NOTIFY;
        }
        props
    }

    fn sample_db() -> DbGattServer {
        let mut db = DbGattServer::new();
        db.add_service(DbGattService::new(
            true,
            btuuid::services::GENERIC_ACCESS,
            vec![
                DbGattChar::new(
                    btuuid::characteristics::DEVICE_NAME,
                    props(true, false, false),
                    vec![],
                    b"bluedirect-server".to_vec(),
                    true,
                ),
                DbGattChar::new(
                    btuuid::characteristics::APPEARANCE,
                    props(true, false, false),
                    vec![],
                    vec![0, 0],
                    false,
                ),
            ],
        ));
        db.add_service(DbGattService::new(
            true,
            btuuid::services::BATTERY,
            vec![DbGattChar::new(
                btuuid::characteristics::BATTERY_LEVEL,
                props(true, false, true),
                vec![DbGattDesc::cccd()],
                vec![100],
                false,
            )],
        ));
        db
    }

    #[test]
    fn handle_assignment_is_depth_first() {
        let mut db = sample_db();
        db.assign_handles(1);

        let gap = db.find_service(btuuid::services::GENERIC_ACCESS).unwrap();
        assert_eq!(gap.handle(), 1);
        let name = gap.find_char(btuuid::characteristics::DEVICE_NAME).unwrap();
        assert_eq!((name.handle(), name.value_handle()), (2, 3));
        let appearance = gap.find_char(btuuid::characteristics::APPEARANCE).unwrap();
        assert_eq!((appearance.handle(), appearance.value_handle()), (4, 5));
        assert_eq!(gap.end_handle(), 5);

        let battery = db.find_service(btuuid::services::BATTERY).unwrap();
        assert_eq!(battery.handle(), 6);
        let level = battery
            .find_char(btuuid::characteristics::BATTERY_LEVEL)
            .unwrap();
        assert_eq!((level.handle(), level.value_handle()), (7, 8));
        assert_eq!(level.client_char_config().unwrap().handle(), 9);
        assert_eq!(battery.end_handle(), 9);

        assert!(db.handles_assigned());
        assert!(!db.add_service(DbGattService::new(
            true,
            btuuid::services::HEART_RATE,
            vec![]
        )));
    }

    #[test]
    fn lookups() {
        let mut db = sample_db();
        db.assign_handles(1);

        assert!(db
            .find_char(
                btuuid::services::BATTERY,
                btuuid::characteristics::BATTERY_LEVEL
            )
            .is_some());
        assert!(db
            .find_char_by_uuid(btuuid::characteristics::APPEARANCE)
            .is_some());
        let (service, characteristic) = db.find_char_by_value_handle(8).unwrap();
        assert_eq!(service.uuid, btuuid::services::BATTERY);
        assert_eq!(characteristic.uuid, btuuid::characteristics::BATTERY_LEVEL);
        assert!(db.find_char_by_value_handle(100).is_none());

        let (_, _, desc) = db.find_desc_by_handle(9).unwrap();
        assert!(desc.is_cccd());
    }

    #[test]
    fn cccd_is_forced_fixed_length() {
        let desc = DbGattDesc::new(
            btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION,
            vec![0, 0],
            true,
        );
        assert!(!desc.variable_length());
        assert!(!desc.write_value(&[1, 0, 0], 0));
        assert!(desc.write_value(&[1, 0], 0));
        assert_eq!(desc.value(), vec![1, 0]);
    }

    #[test]
    fn reset_client_char_config_zeroes() {
        let mut db = sample_db();
        db.assign_handles(1);
        let cccd = db
            .find_client_char_config(
                btuuid::services::BATTERY,
                btuuid::characteristics::BATTERY_LEVEL,
            )
            .unwrap();
        cccd.write_value(&[1, 0], 0);
        assert!(db.reset_client_char_config(
            btuuid::services::BATTERY,
            btuuid::characteristics::BATTERY_LEVEL
        ));
        assert_eq!(cccd.value(), vec![0, 0]);
    }

    #[test]
    fn fixed_length_char_value_keeps_length() {
        let db = sample_db();
        let level = db
            .find_char(
                btuuid::services::BATTERY,
                btuuid::characteristics::BATTERY_LEVEL,
            )
            .unwrap();
        assert!(level.write_value(&[42], 0));
        assert_eq!(level.value(), vec![42]);
        assert!(!level.write_value(&[1, 2], 0));
    }
}
