//! Remote peer lifecycle: connection, SMP pairing, key material, and the
//! client GATT session.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::adapter::{Adapter, AdapterInner, AdapterSettings};
use crate::address::BDAddressAndType;
use crate::btuuid;
use crate::eir::{EInfoReport, EirDataType, EirSource};
use crate::error::ErrorKind;
use crate::gatt::client::CharListenerRegistry;
use crate::gatt::{GattCharListener, GattCharacteristic, GattService};
use crate::hci::{
    ConnectionParameters, DistributedKeys, HciCommand, HciStatus,
};
use crate::smp::{
    BtSecurityLevel, KeyDirection, PairingMode, SmpIdentityResolvingKey, SmpIoCapability,
    SmpKeyMask, SmpLinkKey, SmpLongTermKey, SmpPairingState, SmpSignatureResolvingKey,
};
use crate::listener::AdapterStatusListener;
use crate::util::monotonic_ms;
use crate::{BtRole, DiscoveryPolicy, LePhy, Result, ScanType};

/// The security descent ladder tried by auto security mode, highest
/// requirement first.
pub(crate) fn auto_sec_ladder(io_cap: SmpIoCapability) -> [(BtSecurityLevel, SmpIoCapability); 4] {
    [
        (BtSecurityLevel::EncAuthFips, io_cap),
        (BtSecurityLevel::EncAuth, io_cap),
        (BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput),
        (BtSecurityLevel::None, SmpIoCapability::NoInputNoOutput),
    ]
}

pub(crate) struct DeviceState {
    pub(crate) name: String,
    pub(crate) rssi: i8,
    pub(crate) tx_power: i8,
    pub(crate) eir: EInfoReport,
    pub(crate) eir_ind: Option<EInfoReport>,
    pub(crate) eir_scan_rsp: Option<EInfoReport>,
    pub(crate) ts_creation: u64,
    pub(crate) ts_last_discovery: u64,
    pub(crate) ts_last_update: u64,
    /// Role of the *remote* end: `Slave` for peripherals we connected to,
    /// `Master` for centrals that connected to us.
    pub(crate) role: BtRole,
    /// HCI connection handle; zero while not connected.
    pub(crate) handle: u16,
    pub(crate) valid: bool,
    pub(crate) pairing_state: SmpPairingState,
    pub(crate) pairing_mode: PairingMode,
    /// Security requested by the user for the next connection.
    pub(crate) sec_level_user: BtSecurityLevel,
    pub(crate) io_cap_user: SmpIoCapability,
    /// Security negotiated on the current/last connection.
    pub(crate) sec_level: BtSecurityLevel,
    pub(crate) io_cap: SmpIoCapability,
    pub(crate) auto_sec: bool,
    pub(crate) auto_sec_index: usize,
    pub(crate) auto_sec_io_cap: SmpIoCapability,
    /// Event fan-out withheld while auto security mode iterates.
    pub(crate) suppress_events: bool,
    /// A `device_connected` withheld by suppression, owed to listeners
    /// before any later event of the same connection.
    pub(crate) pending_connected: Option<bool>,
    pub(crate) ready_fired: bool,
    pub(crate) conn_params: ConnectionParameters,
    pub(crate) mtu: u16,
    pub(crate) phy_tx: LePhy,
    pub(crate) phy_rx: LePhy,
    pub(crate) gatt_services: Option<Vec<GattService>>,
}

#[derive(Default)]
pub(crate) struct DeviceKeys {
    pub(crate) avail_init: SmpKeyMask,
    pub(crate) avail_resp: SmpKeyMask,
    pub(crate) init: DistributedKeys,
    pub(crate) resp: DistributedKeys,
}

impl DeviceKeys {
    fn slot(&self, dir: KeyDirection) -> (&SmpKeyMask, &DistributedKeys) {
        match dir {
            KeyDirection::Initiator => (&self.avail_init, &self.init),
            KeyDirection::Responder => (&self.avail_resp, &self.resp),
        }
    }

    pub(crate) fn store(&mut self, dir: KeyDirection, keys: &DistributedKeys) {
        let (mask, slot) = match dir {
            KeyDirection::Initiator => (&mut self.avail_init, &mut self.init),
            KeyDirection::Responder => (&mut self.avail_resp, &mut self.resp),
        };
        if let Some(ltk) = keys.ltk {
            slot.ltk = Some(ltk);
            *mask |= SmpKeyMask::ENC_KEY;
        }
        if let Some(irk) = keys.irk {
            slot.irk = Some(irk);
            *mask |= SmpKeyMask::ID_KEY;
        }
        if let Some(csrk) = keys.csrk {
            slot.csrk = Some(csrk);
            *mask |= SmpKeyMask::SIGN_KEY;
        }
        if let Some(lk) = keys.lk {
            slot.lk = Some(lk);
            *mask |= SmpKeyMask::LINK_KEY;
        }
    }

    fn clear(&mut self) {
        *self = DeviceKeys::default();
    }
}

type ListenerPair = (Arc<dyn AdapterStatusListener>, Arc<dyn AdapterStatusListener>);

pub(crate) struct DeviceInner {
    pub(crate) adapter: Weak<AdapterInner>,
    pub(crate) address: BDAddressAndType,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) keys: Mutex<DeviceKeys>,
    pub(crate) char_listeners: CharListenerRegistry,
    /// Device-scoped status listeners with their adapter-registered wrappers.
    pub(crate) scoped_listeners: Mutex<Vec<ListenerPair>>,
}

/// Forwards adapter-level callbacks unfiltered and device callbacks only for
/// one peer.
struct ScopedStatusListener {
    address: BDAddressAndType,
    inner: Arc<dyn AdapterStatusListener>,
}

impl AdapterStatusListener for ScopedStatusListener {
    fn adapter_settings_changed(
        &self,
        adapter: &Adapter,
        old: AdapterSettings,
        changed: AdapterSettings,
        new: AdapterSettings,
        timestamp: u64,
    ) {
        self.inner
            .adapter_settings_changed(adapter, old, changed, new, timestamp);
    }

    fn discovering_changed(
        &self,
        adapter: &Adapter,
        current: ScanType,
        changed: ScanType,
        enabled: bool,
        policy: DiscoveryPolicy,
        timestamp: u64,
    ) {
        self.inner
            .discovering_changed(adapter, current, changed, enabled, policy, timestamp);
    }

    fn device_found(&self, device: &Device, timestamp: u64) -> bool {
        if device.address_and_type() == self.address {
            self.inner.device_found(device, timestamp)
        } else {
            false
        }
    }

    fn device_updated(&self, device: &Device, updated: EirDataType, timestamp: u64) {
        if device.address_and_type() == self.address {
            self.inner.device_updated(device, updated, timestamp);
        }
    }

    fn device_connected(&self, device: &Device, discovered: bool, timestamp: u64) {
        if device.address_and_type() == self.address {
            self.inner.device_connected(device, discovered, timestamp);
        }
    }

    fn device_pairing_state(
        &self,
        device: &Device,
        state: SmpPairingState,
        mode: PairingMode,
        timestamp: u64,
    ) {
        if device.address_and_type() == self.address {
            self.inner.device_pairing_state(device, state, mode, timestamp);
        }
    }

    fn device_ready(&self, device: &Device, timestamp: u64) {
        if device.address_and_type() == self.address {
            self.inner.device_ready(device, timestamp);
        }
    }

    fn device_disconnected(
        &self,
        device: &Device,
        reason: crate::hci::HciStatus,
        handle: u16,
        timestamp: u64,
    ) {
        if device.address_and_type() == self.address {
            self.inner.device_disconnected(device, reason, handle, timestamp);
        }
    }
}

/// A remote Bluetooth LE device below one [`Adapter`].
///
/// Cloning is cheap and clones refer to the same device; equality and hashing
/// are by identity.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Device")
            .field("address", &self.inner.address)
            .field("name", &state.name)
            .field("handle", &state.handle)
            .field("pairing_state", &state.pairing_state)
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name.is_empty() {
            write!(f, "{}", self.inner.address)
        } else {
            write!(f, "{} '{}'", self.inner.address, name)
        }
    }
}

impl Device {
    pub(crate) fn new(adapter: &Arc<AdapterInner>, address: BDAddressAndType) -> Self {
        let now = monotonic_ms();
        Device {
            inner: Arc::new(DeviceInner {
                adapter: Arc::downgrade(adapter),
                address,
                state: Mutex::new(DeviceState {
                    name: String::new(),
                    rssi: 0,
                    tx_power: 0,
                    eir: EInfoReport::default(),
                    eir_ind: None,
                    eir_scan_rsp: None,
                    ts_creation: now,
                    ts_last_discovery: now,
                    ts_last_update: now,
                    role: BtRole::None,
                    handle: 0,
                    valid: true,
                    pairing_state: SmpPairingState::None,
                    pairing_mode: PairingMode::None,
                    sec_level_user: BtSecurityLevel::Unset,
                    io_cap_user: SmpIoCapability::Unset,
                    sec_level: BtSecurityLevel::Unset,
                    io_cap: SmpIoCapability::Unset,
                    auto_sec: false,
                    auto_sec_index: 0,
                    auto_sec_io_cap: SmpIoCapability::Unset,
                    suppress_events: false,
                    pending_connected: None,
                    ready_fired: false,
                    conn_params: ConnectionParameters::default(),
                    mtu: 23,
                    phy_tx: LePhy::Le1M,
                    phy_rx: LePhy::Le1M,
                    gatt_services: None,
                }),
                keys: Mutex::new(DeviceKeys::default()),
                char_listeners: CharListenerRegistry::new(),
                scoped_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn upgrade(weak: &Weak<DeviceInner>) -> Option<Device> {
        weak.upgrade().map(|inner| Device { inner })
    }

    /// The stable identity of this remote peer.
    pub fn address_and_type(&self) -> BDAddressAndType {
        self.inner.address
    }

    /// The adapter this device belongs to, while it is alive.
    pub fn adapter(&self) -> Option<Adapter> {
        self.inner.adapter.upgrade().map(Adapter::from_inner)
    }

    /// The device name from advertising data or the GAP service; empty if
    /// unknown.
    pub fn name(&self) -> String {
        self.inner.state.lock().unwrap().name.clone()
    }

    /// Most recently received signal strength in dBm.
    pub fn rssi(&self) -> i8 {
        self.inner.state.lock().unwrap().rssi
    }

    /// Advertised transmit power in dBm, zero if never reported.
    pub fn tx_power(&self) -> i8 {
        self.inner.state.lock().unwrap().tx_power
    }

    /// The merged advertising state of this peer.
    pub fn eir(&self) -> EInfoReport {
        self.inner.state.lock().unwrap().eir.clone()
    }

    /// The last advertising indication, if any.
    pub fn eir_ind(&self) -> Option<EInfoReport> {
        self.inner.state.lock().unwrap().eir_ind.clone()
    }

    /// The last scan response, if any.
    pub fn eir_scan_rsp(&self) -> Option<EInfoReport> {
        self.inner.state.lock().unwrap().eir_scan_rsp.clone()
    }

    /// Role of the remote end: `Slave` for peripherals this host connected
    /// to, `Master` for centrals that connected to this host.
    pub fn role(&self) -> BtRole {
        self.inner.state.lock().unwrap().role
    }

    /// Monotonic ms when this device object was created.
    pub fn ts_creation(&self) -> u64 {
        self.inner.state.lock().unwrap().ts_creation
    }

    /// Monotonic ms of the last advertising report.
    pub fn ts_last_discovery(&self) -> u64 {
        self.inner.state.lock().unwrap().ts_last_discovery
    }

    /// Monotonic ms of the last state update.
    pub fn ts_last_update(&self) -> u64 {
        self.inner.state.lock().unwrap().ts_last_update
    }

    /// Whether an HCI connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().handle != 0
    }

    /// The HCI connection handle, zero while not connected.
    pub fn connection_handle(&self) -> u16 {
        self.inner.state.lock().unwrap().handle
    }

    /// `false` once [`remove`][Self::remove] dropped this device from its
    /// adapter.
    pub fn is_valid(&self) -> bool {
        self.inner.state.lock().unwrap().valid
    }

    /// Current SMP pairing state.
    pub fn pairing_state(&self) -> SmpPairingState {
        self.inner.state.lock().unwrap().pairing_state
    }

    /// Pairing mode selected by the feature exchange.
    pub fn pairing_mode(&self) -> PairingMode {
        self.inner.state.lock().unwrap().pairing_mode
    }

    /// Security level negotiated on the current or last connection.
    pub fn sec_level(&self) -> BtSecurityLevel {
        self.inner.state.lock().unwrap().sec_level
    }

    /// IO capability negotiated on the current or last connection.
    pub fn io_capability(&self) -> SmpIoCapability {
        self.inner.state.lock().unwrap().io_cap
    }

    /// Transmit and receive PHY of the current connection.
    pub fn phys(&self) -> (LePhy, LePhy) {
        let state = self.inner.state.lock().unwrap();
        (state.phy_tx, state.phy_rx)
    }

    /// Negotiated ATT MTU of the current connection.
    pub fn att_mtu(&self) -> u16 {
        self.inner.state.lock().unwrap().mtu
    }

    /// Sets the parameters used by subsequent connection attempts.
    pub fn set_connection_parameters(&self, params: ConnectionParameters) {
        self.inner.state.lock().unwrap().conn_params = params;
    }

    /// Requests a security level and IO capability for the next connection.
    ///
    /// Returns [`HciStatus::CommandDisallowed`] while connected.
    pub fn set_connection_security(
        &self,
        level: BtSecurityLevel,
        io_cap: SmpIoCapability,
    ) -> HciStatus {
        let mut state = self.inner.state.lock().unwrap();
        if state.handle != 0 {
            return HciStatus::CommandDisallowed;
        }
        state.sec_level_user = level;
        state.io_cap_user = io_cap;
        state.auto_sec = false;
        HciStatus::Success
    }

    /// Enables auto security mode: the connect-pair cycle is retried with
    /// decreasing requirements, starting at `EncAuthFips` with the given IO
    /// capability. Intermediate connect/disconnect events are withheld from
    /// listeners until the descent succeeds or finally fails.
    pub fn set_connection_security_auto(&self, io_cap: SmpIoCapability) -> HciStatus {
        let mut state = self.inner.state.lock().unwrap();
        if state.handle != 0 {
            return HciStatus::CommandDisallowed;
        }
        let ladder = auto_sec_ladder(io_cap);
        state.auto_sec = true;
        state.auto_sec_index = 0;
        state.auto_sec_io_cap = io_cap;
        (state.sec_level_user, state.io_cap_user) = ladder[0];
        HciStatus::Success
    }

    /// Uploads a long-term key to the controller ahead of a connection, so
    /// the next link to this peer comes up encrypted (pre-paired).
    ///
    /// Returns [`HciStatus::ConnectionAlreadyExists`] while connected.
    pub fn upload_long_term_key(&self, ltk: SmpLongTermKey) -> HciStatus {
        if self.is_connected() {
            return HciStatus::ConnectionAlreadyExists;
        }
        let adapter = match self.inner.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return HciStatus::Failed,
        };
        let status = adapter.submit(HciCommand::UploadLongTermKey {
            peer: self.inner.address,
            ltk,
        });
        if status.is_ok() {
            let dir = if ltk.is_responder() {
                KeyDirection::Responder
            } else {
                KeyDirection::Initiator
            };
            self.inner.keys.lock().unwrap().store(
                dir,
                &DistributedKeys {
                    ltk: Some(ltk),
                    ..Default::default()
                },
            );
        }
        status
    }

    /// Key classes available for `dir` on this device.
    pub fn available_keys(&self, dir: KeyDirection) -> SmpKeyMask {
        *self.inner.keys.lock().unwrap().slot(dir).0
    }

    /// The long-term key for `dir`, if distributed.
    pub fn long_term_key(&self, dir: KeyDirection) -> Option<SmpLongTermKey> {
        self.inner.keys.lock().unwrap().slot(dir).1.ltk
    }

    /// The identity resolving key for `dir`, if distributed.
    pub fn identity_resolving_key(&self, dir: KeyDirection) -> Option<SmpIdentityResolvingKey> {
        self.inner.keys.lock().unwrap().slot(dir).1.irk
    }

    /// The signature resolving key for `dir`, if distributed.
    pub fn signature_resolving_key(&self, dir: KeyDirection) -> Option<SmpSignatureResolvingKey> {
        self.inner.keys.lock().unwrap().slot(dir).1.csrk
    }

    /// The link key for `dir`, if distributed.
    pub fn link_key(&self, dir: KeyDirection) -> Option<SmpLinkKey> {
        self.inner.keys.lock().unwrap().slot(dir).1.lk
    }

    /// Drops all local key material and security state for this peer.
    pub fn unpair(&self) -> HciStatus {
        self.inner.keys.lock().unwrap().clear();
        let mut state = self.inner.state.lock().unwrap();
        state.pairing_state = SmpPairingState::None;
        state.pairing_mode = PairingMode::None;
        state.sec_level = BtSecurityLevel::Unset;
        state.io_cap = SmpIoCapability::Unset;
        state.sec_level_user = BtSecurityLevel::Unset;
        state.io_cap_user = SmpIoCapability::Unset;
        state.auto_sec = false;
        HciStatus::Success
    }

    /// Connects using the peer's address type: LE types via
    /// [`connect_le`][Self::connect_le], BR/EDR peers are not supported by
    /// this LE core.
    pub fn connect(&self) -> HciStatus {
        match self.inner.address.address_type {
            t if t.is_le() => self.connect_le(),
            _ => HciStatus::NotSupported,
        }
    }

    /// Initiates an LE connection with the stored connection parameters.
    ///
    /// Completion is reported through
    /// [`device_connected`][crate::AdapterStatusListener::device_connected];
    /// failure through `device_disconnected` with the failure reason.
    pub fn connect_le(&self) -> HciStatus {
        let adapter = match self.inner.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return HciStatus::Failed,
        };
        let (params, sec_level, io_cap) = {
            let state = self.inner.state.lock().unwrap();
            if !state.valid {
                return HciStatus::InvalidParams;
            }
            if state.handle != 0 {
                return HciStatus::ConnectionAlreadyExists;
            }
            (state.conn_params, state.sec_level_user, state.io_cap_user)
        };
        adapter.connect_device(self, params, sec_level, io_cap)
    }

    /// Closes the HCI connection. Asynchronous: `device_disconnected`
    /// eventually fires. Idempotent while already disconnected.
    pub fn disconnect(&self) -> HciStatus {
        let adapter = match self.inner.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return HciStatus::Failed,
        };
        if !self.is_connected() {
            return HciStatus::Success;
        }
        adapter.submit(HciCommand::Disconnect {
            peer: self.inner.address,
            reason: HciStatus::RemoteUserTerminatedConnection,
        })
    }

    /// Disconnects if needed and drops this device from the adapter's
    /// discovered, connected and shared collections.
    ///
    /// Idempotent: removing an already removed device succeeds without
    /// effect. The handle stays usable for queries but
    /// [`is_valid`][Self::is_valid] turns `false`. Do not call `remove`
    /// concurrently from two threads for the same device.
    pub fn remove(&self) -> HciStatus {
        let adapter = match self.inner.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return HciStatus::Failed,
        };
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.valid {
                return HciStatus::Success;
            }
            state.valid = false;
        }
        if self.is_connected() {
            let status = adapter.submit(HciCommand::Disconnect {
                peer: self.inner.address,
                reason: HciStatus::RemoteUserTerminatedConnection,
            });
            if !status.is_ok() {
                warn!(device = %self, %status, "disconnect on remove failed");
            }
        }
        let scoped = std::mem::take(&mut *self.inner.scoped_listeners.lock().unwrap());
        for (_, wrapper) in &scoped {
            Adapter::from_inner(adapter.clone()).remove_status_listener(wrapper);
        }
        adapter.evict_device(self);
        HciStatus::Success
    }

    /// Supplies the passkey requested in the `PasskeyExpected` pairing
    /// state. Only valid in that state.
    pub fn set_pairing_passkey(&self, passkey: u32) -> HciStatus {
        self.passkey_reply(Some(passkey))
    }

    /// Gracefully rejects a passkey request. Only valid in the
    /// `PasskeyExpected` pairing state.
    pub fn set_pairing_passkey_negative(&self) -> HciStatus {
        self.passkey_reply(None)
    }

    fn passkey_reply(&self, passkey: Option<u32>) -> HciStatus {
        if self.pairing_state() != SmpPairingState::PasskeyExpected {
            return HciStatus::CommandDisallowed;
        }
        let adapter = match self.inner.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return HciStatus::Failed,
        };
        adapter.submit(HciCommand::PasskeyReply {
            peer: self.inner.address,
            passkey,
        })
    }

    /// Answers the numeric comparison requested in the
    /// `NumericCompareExpected` pairing state. Only valid in that state.
    pub fn set_pairing_numeric_comparison(&self, accept: bool) -> HciStatus {
        if self.pairing_state() != SmpPairingState::NumericCompareExpected {
            return HciStatus::CommandDisallowed;
        }
        let adapter = match self.inner.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return HciStatus::Failed,
        };
        adapter.submit(HciCommand::NumericComparisonReply {
            peer: self.inner.address,
            accept,
        })
    }

    /// The peer's GATT services, discovered once per connection and cached.
    ///
    /// The first call after connecting performs the MTU exchange and full
    /// service discovery, and fills the device name from the GAP service if
    /// advertising did not provide one. Returns an empty list on transmission
    /// failure.
    pub fn gatt_services(&self) -> Vec<GattService> {
        if let Some(services) = &self.inner.state.lock().unwrap().gatt_services {
            return services.clone();
        }
        let adapter = match self.inner.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return Vec::new(),
        };
        if !self.is_connected() {
            return Vec::new();
        }
        match self.discover_gatt(&adapter) {
            Ok(services) => services,
            Err(err) => {
                warn!(device = %self, %err, "GATT discovery failed");
                Vec::new()
            }
        }
    }

    fn discover_gatt(&self, adapter: &Arc<AdapterInner>) -> Result<Vec<GattService>> {
        let peer = self.inner.address;
        let mtu = adapter
            .controller()
            .att_exchange_mtu(peer, crate::gatt::DEFAULT_MAX_ATT_MTU)?;
        let defs = adapter.controller().att_discover(peer)?;
        let services = GattService::from_defs(&Arc::downgrade(&self.inner), defs);

        let mut name_from_gap = None;
        {
            let state = self.inner.state.lock().unwrap();
            if state.eir.name().is_none() && state.name.is_empty() {
                name_from_gap = services
                    .iter()
                    .find(|s| s.uuid == btuuid::services::GENERIC_ACCESS)
                    .and_then(|s| s.find_char(btuuid::characteristics::DEVICE_NAME))
                    .map(|c| c.value_handle);
            }
        }
        if let Some(value_handle) = name_from_gap {
            if let Ok(raw) = adapter.controller().att_read(peer, value_handle) {
                let name = String::from_utf8_lossy(&raw).into_owned();
                if !name.is_empty() {
                    self.inner.state.lock().unwrap().name = name;
                }
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            state.mtu = mtu;
            state.gatt_services = Some(services.clone());
        }
        debug!(device = %self, count = services.len(), mtu, "GATT services discovered");
        Ok(services)
    }

    /// Finds a cached characteristic within a specific service.
    pub fn find_gatt_char(
        &self,
        service_uuid: uuid::Uuid,
        char_uuid: uuid::Uuid,
    ) -> Option<GattCharacteristic> {
        self.gatt_services()
            .iter()
            .find(|s| s.uuid == service_uuid)
            .and_then(|s| s.find_char(char_uuid))
            .cloned()
    }

    /// Attaches a device-wide characteristic value listener.
    pub fn add_char_listener(&self, listener: Arc<dyn GattCharListener>) -> bool {
        self.inner.char_listeners.add(listener, None)
    }

    pub(crate) fn add_char_listener_for(
        &self,
        listener: Arc<dyn GattCharListener>,
        value_handle: Option<u16>,
    ) -> bool {
        self.inner.char_listeners.add(listener, value_handle)
    }

    /// Detaches a characteristic value listener.
    pub fn remove_char_listener(&self, listener: &Arc<dyn GattCharListener>) -> bool {
        self.inner.char_listeners.remove(listener)
    }

    /// Detaches all characteristic value listeners, returning the count.
    pub fn remove_all_char_listeners(&self) -> usize {
        self.inner.char_listeners.clear()
    }

    /// Number of attached characteristic value listeners.
    pub fn char_listener_count(&self) -> usize {
        self.inner.char_listeners.len()
    }

    /// Attaches a status listener scoped to this device: device callbacks are
    /// forwarded only for this peer, adapter-level callbacks unfiltered.
    ///
    /// Identity based; returns `false` if this instance is already attached
    /// via this device.
    pub fn add_status_listener(&self, listener: Arc<dyn AdapterStatusListener>) -> bool {
        let adapter = match self.adapter() {
            Some(adapter) => adapter,
            None => return false,
        };
        let mut scoped = self.inner.scoped_listeners.lock().unwrap();
        if scoped.iter().any(|(l, _)| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        let wrapper: Arc<dyn AdapterStatusListener> = Arc::new(ScopedStatusListener {
            address: self.inner.address,
            inner: listener.clone(),
        });
        if !adapter.add_status_listener(wrapper.clone()) {
            return false;
        }
        scoped.push((listener, wrapper));
        true
    }

    /// Detaches a status listener attached via
    /// [`add_status_listener`][Self::add_status_listener].
    pub fn remove_status_listener(&self, listener: &Arc<dyn AdapterStatusListener>) -> bool {
        let wrapper = {
            let mut scoped = self.inner.scoped_listeners.lock().unwrap();
            match scoped.iter().position(|(l, _)| Arc::ptr_eq(l, listener)) {
                Some(idx) => scoped.remove(idx).1,
                None => return false,
            }
        };
        match self.adapter() {
            Some(adapter) => adapter.remove_status_listener(&wrapper),
            None => false,
        }
    }

    /// Number of status listeners attached via this device.
    pub fn status_listener_count(&self) -> usize {
        self.inner.scoped_listeners.lock().unwrap().len()
    }

    pub(crate) fn att_read(&self, value_handle: u16) -> Result<Vec<u8>> {
        let adapter = self
            .inner
            .adapter
            .upgrade()
            .ok_or(ErrorKind::AdapterUnavailable)?;
        if !self.is_connected() {
            return Err(ErrorKind::NotConnected.into());
        }
        adapter.controller().att_read(self.inner.address, value_handle)
    }

    pub(crate) fn att_write(
        &self,
        value_handle: u16,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let adapter = self
            .inner
            .adapter
            .upgrade()
            .ok_or(ErrorKind::AdapterUnavailable)?;
        if !self.is_connected() {
            return Err(ErrorKind::NotConnected.into());
        }
        adapter
            .controller()
            .att_write(self.inner.address, value_handle, value, with_response)
    }

    // ---- state transitions driven by the adapter dispatch thread ----

    /// Folds an advertising report in; returns the changed field mask.
    pub(crate) fn update_from_eir(&self, report: &EInfoReport) -> EirDataType {
        let mut state = self.inner.state.lock().unwrap();
        let changed = state.eir.set(report);
        match report.source() {
            EirSource::AdInd => state.eir_ind = Some(report.clone()),
            EirSource::AdScanRsp => state.eir_scan_rsp = Some(report.clone()),
            _ => {}
        }
        if let Some(rssi) = report.rssi() {
            state.rssi = rssi;
        }
        if let Some(tx_power) = report.tx_power() {
            state.tx_power = tx_power;
        }
        if state.name.is_empty() {
            if let Some(name) = report.name().or(report.name_short()) {
                state.name = name.to_string();
            }
        } else if let Some(name) = report.name() {
            if state.name != name {
                state.name = name.to_string();
            }
        }
        state.ts_last_discovery = report.timestamp();
        state.ts_last_update = report.timestamp();
        changed
    }

    pub(crate) fn set_connected(&self, handle: u16, remote_role: BtRole, ts: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.handle = handle;
        state.role = remote_role;
        state.ready_fired = false;
        state.mtu = 23;
        state.gatt_services = None;
        state.ts_last_update = ts;
    }

    pub(crate) fn set_disconnected(&self, ts: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.handle = 0;
        state.pairing_state = SmpPairingState::None;
        state.pairing_mode = PairingMode::None;
        state.ready_fired = false;
        state.gatt_services = None;
        state.mtu = 23;
        state.ts_last_update = ts;
    }

    pub(crate) fn set_pairing(&self, pairing_state: SmpPairingState, mode: PairingMode, ts: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.pairing_state = pairing_state;
        if mode != PairingMode::None || pairing_state == SmpPairingState::None {
            state.pairing_mode = mode;
        }
        if pairing_state == SmpPairingState::Completed {
            state.sec_level = if mode == PairingMode::PrePaired {
                BtSecurityLevel::EncOnly
            } else {
                state.sec_level_user
            };
            state.io_cap = state.io_cap_user;
        }
        state.ts_last_update = ts;
    }

    pub(crate) fn store_keys(&self, dir: KeyDirection, keys: &DistributedKeys) {
        self.inner.keys.lock().unwrap().store(dir, keys);
    }

    /// Delivers a notification or indication to the matching listeners.
    pub(crate) fn deliver_char_value(
        &self,
        value_handle: u16,
        value: &[u8],
        ts: u64,
        indication: Option<bool>,
    ) {
        let characteristic = {
            let state = self.inner.state.lock().unwrap();
            state.gatt_services.as_ref().and_then(|services| {
                services
                    .iter()
                    .flat_map(|s| s.characteristics.iter())
                    .find(|c| c.value_handle == value_handle)
                    .cloned()
            })
        };
        let characteristic = match characteristic {
            Some(c) => c,
            None => {
                debug!(device = %self, value_handle, "value event for undiscovered characteristic");
                return;
            }
        };
        for listener in self.inner.char_listeners.matching(value_handle) {
            match indication {
                Some(confirmation_sent) => {
                    crate::util::shielded("indication_received", || {
                        listener.indication_received(&characteristic, value, ts, confirmation_sent)
                    });
                }
                None => {
                    crate::util::shielded("notification_received", || {
                        listener.notification_received(&characteristic, value, ts)
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_descends() {
        let ladder = auto_sec_ladder(SmpIoCapability::DisplayYesNo);
        assert_eq!(
            ladder[0],
            (BtSecurityLevel::EncAuthFips, SmpIoCapability::DisplayYesNo)
        );
        assert_eq!(
            ladder[1],
            (BtSecurityLevel::EncAuth, SmpIoCapability::DisplayYesNo)
        );
        assert_eq!(
            ladder[2],
            (BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput)
        );
        assert_eq!(
            ladder[3],
            (BtSecurityLevel::None, SmpIoCapability::NoInputNoOutput)
        );
    }

    #[test]
    fn device_keys_masks_follow_stores() {
        let mut keys = DeviceKeys::default();
        keys.store(
            KeyDirection::Initiator,
            &DistributedKeys {
                ltk: Some(SmpLongTermKey {
                    enc_size: 16,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert_eq!(keys.avail_init, SmpKeyMask::ENC_KEY);
        assert_eq!(keys.avail_resp, SmpKeyMask::empty());

        keys.store(
            KeyDirection::Responder,
            &DistributedKeys {
                irk: Some(SmpIdentityResolvingKey::default()),
                csrk: Some(SmpSignatureResolvingKey::default()),
                ..Default::default()
            },
        );
        assert_eq!(keys.avail_resp, SmpKeyMask::ID_KEY | SmpKeyMask::SIGN_KEY);

        keys.clear();
        assert_eq!(keys.avail_init, SmpKeyMask::empty());
    }
}
