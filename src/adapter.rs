//! Local Bluetooth controller abstraction: power, discovery, advertising,
//! whitelist, and the per-adapter event engine.
//!
//! Every adapter owns its controller's event stream, consumed by one
//! dispatch thread (see [`dispatch`][crate::dispatch]); all state transitions
//! of the adapter and of its devices happen there, which serializes listener
//! callbacks per adapter.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::address::BDAddressAndType;
use crate::device::Device;
use crate::dispatch::{self, Dispatcher, InternalMsg};
use crate::eir::{EInfoReport, EirDataType, GapFlags};
use crate::gatt::DbGattServer;
use crate::hci::{
    AdvertisingParameters, ControllerEvent, DefaultConnectionParams, DistributedKeys, HciCommand,
    HciController, HciStatus, ScanParameters,
};
use crate::listener::{AdapterStatusListener, ListenerList};
use crate::smp::{BtSecurityLevel, KeyDirection, PairingMode, SmpIoCapability, SmpKeyBin,
    SmpPairingState};
use crate::util::{monotonic_ms, shielded};
use crate::{BtMode, BtRole, DiscoveryPolicy, ScanType};

bitflags! {
    /// Controller settings, mirroring the management API setting bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    #[allow(missing_docs)]
    pub struct AdapterSettings: u32 {
        const POWERED = 1 << 0;
        const CONNECTABLE = 1 << 1;
        const FAST_CONNECTABLE = 1 << 2;
        const DISCOVERABLE = 1 << 3;
        const BONDABLE = 1 << 4;
        const LINK_SECURITY = 1 << 5;
        const SSP = 1 << 6;
        const BREDR = 1 << 7;
        const HS = 1 << 8;
        const LE = 1 << 9;
        const ADVERTISING = 1 << 10;
        const SECURE_CONN = 1 << 11;
        const DEBUG_KEYS = 1 << 12;
        const PRIVACY = 1 << 13;
        const CONFIGURATION = 1 << 14;
        const STATIC_ADDRESS = 1 << 15;
    }
}

/// A whitelist entry with its per-peer connection parameters.
///
/// Intervals in 1.25 ms units, supervision timeout in 10 ms units.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhitelistEntry {
    pub address: BDAddressAndType,
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
}

/// Why a device leaves the discovery-pausing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseRelease {
    Disconnected,
    Ready,
    Paired,
}

struct AdapterState {
    name: String,
    short_name: String,
    settings: AdapterSettings,
    bt_mode: BtMode,
    role: BtRole,
    scan_type: ScanType,
    scan_params: ScanParameters,
    policy: DiscoveryPolicy,
    advertising: bool,
    /// Discovery was paused by this host and should resume when the pausing
    /// queue empties.
    resume_pending: bool,
    /// The user called `stop_discovery`; no automatic resume.
    explicit_scan_stop: bool,
    pausing_devices: Vec<BDAddressAndType>,
    default_conn_params: DefaultConnectionParams,
    whitelist: Vec<WhitelistEntry>,
    key_path: Option<PathBuf>,
    key_cache: Vec<SmpKeyBin>,
    gatt_server: Option<Arc<DbGattServer>>,
}

#[derive(Default)]
struct DeviceCollections {
    discovered: Vec<Device>,
    connected: Vec<Device>,
    shared: Vec<Device>,
}

impl DeviceCollections {
    fn find(&self, address: &BDAddressAndType) -> Option<Device> {
        self.shared
            .iter()
            .chain(self.connected.iter())
            .chain(self.discovered.iter())
            .find(|d| d.address_and_type() == *address)
            .cloned()
    }

    fn remove_everywhere(&mut self, device: &Device) {
        self.discovered.retain(|d| d != device);
        self.connected.retain(|d| d != device);
        self.shared.retain(|d| d != device);
    }
}

pub(crate) struct AdapterInner {
    weak_self: std::sync::Weak<AdapterInner>,
    controller: Arc<dyn HciController>,
    dev_id: u16,
    address: BDAddressAndType,
    state: Mutex<AdapterState>,
    devices: Mutex<DeviceCollections>,
    listeners: ListenerList<dyn AdapterStatusListener>,
    cmd_lock: Mutex<()>,
    dispatcher: Mutex<Option<Dispatcher>>,
    closed: AtomicBool,
    invalidated: AtomicBool,
}

/// A local Bluetooth LE controller.
///
/// Cloning is cheap and clones refer to the same adapter; equality and
/// hashing are by identity.
#[derive(Clone)]
pub struct Adapter {
    pub(crate) inner: Arc<AdapterInner>,
}

impl PartialEq for Adapter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Adapter {}

impl std::hash::Hash for Adapter {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("dev_id", &self.inner.dev_id)
            .field("address", &self.inner.address)
            .finish()
    }
}

impl std::fmt::Display for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "adapter #{} {}", self.inner.dev_id, self.inner.address)
    }
}

impl Adapter {
    /// Creates an adapter bound to `controller` and starts its dispatch
    /// thread.
    pub fn new(controller: Arc<dyn HciController>) -> Adapter {
        Adapter::with_mode(controller, BtMode::Le)
    }

    /// [`Adapter::new`] with an explicit initial Bluetooth mode.
    pub fn with_mode(controller: Arc<dyn HciController>, bt_mode: BtMode) -> Adapter {
        let dev_id = controller.dev_id();
        let address = controller.address();
        let name = controller.name();
        let inner = Arc::new_cyclic(|weak_self| AdapterInner {
            weak_self: weak_self.clone(),
            controller: controller.clone(),
            dev_id,
            address,
            state: Mutex::new(AdapterState {
                name,
                short_name: String::new(),
                settings: AdapterSettings::empty(),
                bt_mode,
                role: BtRole::None,
                scan_type: ScanType::None,
                scan_params: ScanParameters::default(),
                policy: DiscoveryPolicy::default(),
                advertising: false,
                resume_pending: false,
                explicit_scan_stop: false,
                pausing_devices: Vec::new(),
                default_conn_params: DefaultConnectionParams::default(),
                whitelist: Vec::new(),
                key_path: None,
                key_cache: Vec::new(),
                gatt_server: None,
            }),
            devices: Mutex::new(DeviceCollections::default()),
            listeners: ListenerList::new(),
            cmd_lock: Mutex::new(()),
            dispatcher: Mutex::new(None),
            closed: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
        });
        let dispatcher = dispatch::spawn(inner.clone(), controller.events());
        *inner.dispatcher.lock().unwrap() = Some(dispatcher);
        Adapter { inner }
    }

    pub(crate) fn from_inner(inner: Arc<AdapterInner>) -> Adapter {
        Adapter { inner }
    }

    /// Host-side controller index.
    pub fn dev_id(&self) -> u16 {
        self.inner.dev_id
    }

    /// The adapter's public identity address.
    pub fn address_and_type(&self) -> BDAddressAndType {
        self.inner.address
    }

    /// The address currently visible on air; differs from the public one
    /// when privacy is enabled.
    pub fn visible_address_and_type(&self) -> BDAddressAndType {
        self.inner.controller.visible_address()
    }

    /// The controller's supported LE Link Layer features.
    pub fn le_features(&self) -> crate::hci::LeFeatures {
        self.inner.controller.le_features()
    }

    /// The adapter name.
    pub fn name(&self) -> String {
        self.inner.state.lock().unwrap().name.clone()
    }

    /// The short adapter name.
    pub fn short_name(&self) -> String {
        self.inner.state.lock().unwrap().short_name.clone()
    }

    /// Sets local name and short name. Only allowed while powered off.
    pub fn set_name(&self, name: &str, short_name: &str) -> HciStatus {
        if self.is_powered() {
            return HciStatus::CommandDisallowed;
        }
        let status = self.inner.submit(HciCommand::SetName {
            name: name.into(),
            short_name: short_name.into(),
        });
        if status.is_ok() {
            let mut state = self.inner.state.lock().unwrap();
            state.name = name.into();
            state.short_name = short_name.into();
        }
        status
    }

    /// The configured Bluetooth mode.
    pub fn bt_mode(&self) -> BtMode {
        self.inner.state.lock().unwrap().bt_mode
    }

    /// The adapter role: `Master` after discovery, `Slave` after
    /// advertising.
    pub fn role(&self) -> BtRole {
        self.inner.state.lock().unwrap().role
    }

    /// `false` once the adapter was closed or its controller failed.
    pub fn is_valid(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && !self.inner.invalidated.load(Ordering::Acquire)
    }

    /// Whether the controller is powered.
    pub fn is_powered(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .settings
            .contains(AdapterSettings::POWERED)
    }

    /// Current adapter settings.
    pub fn settings(&self) -> AdapterSettings {
        self.inner.state.lock().unwrap().settings
    }

    /// Resets and powers the controller, then loads persisted SMP keys if a
    /// key path is configured.
    pub fn initialize(&self, bt_mode: BtMode) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::Failed;
        }
        let status = self.inner.submit(HciCommand::Reset);
        if !status.is_ok() {
            return status;
        }
        let status = self.inner.submit(HciCommand::SetPowered(true));
        if !status.is_ok() {
            return status;
        }
        self.inner.state.lock().unwrap().bt_mode = bt_mode;
        self.inner.load_smp_keys();
        info!(adapter = %self, ?bt_mode, "initialized");
        HciStatus::Success
    }

    /// Powers the controller up or down.
    pub fn set_powered(&self, powered: bool) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::Failed;
        }
        self.inner.submit(HciCommand::SetPowered(powered))
    }

    /// Issues a full controller reset.
    pub fn reset(&self) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::Failed;
        }
        self.inner.submit(HciCommand::Reset)
    }

    /// Directory for persistent SMP key records. Keys are loaded on
    /// [`initialize`][Self::initialize] and freshly bonded peripheral-side
    /// keys are stored automatically.
    pub fn set_smp_key_path(&self, path: impl Into<PathBuf>) {
        self.inner.state.lock().unwrap().key_path = Some(path.into());
    }

    /// The configured key directory.
    pub fn smp_key_path(&self) -> Option<PathBuf> {
        self.inner.state.lock().unwrap().key_path.clone()
    }

    // ---- discovery ----

    /// Starts LE discovery, always clearing the discovered-devices set
    /// first. Forces the adapter role to `Master`.
    ///
    /// Rejected with [`HciStatus::CommandDisallowed`] while advertising or
    /// powered off.
    pub fn start_discovery(&self, policy: DiscoveryPolicy, params: ScanParameters) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::Failed;
        }
        {
            let state = self.inner.state.lock().unwrap();
            if !state.settings.contains(AdapterSettings::POWERED) {
                return HciStatus::CommandDisallowed;
            }
            if state.advertising {
                return HciStatus::CommandDisallowed;
            }
        }
        let params = ScanParameters {
            interval: params.interval.clamp(4, 16384),
            window: params.window.clamp(4, 16384).min(params.interval.clamp(4, 16384)),
            ..params
        };

        self.inner.devices.lock().unwrap().discovered.clear();

        let status = self.inner.submit(HciCommand::SetScanParams(params));
        if !status.is_ok() {
            return status;
        }
        let status = self.inner.submit(HciCommand::SetScanEnable {
            enabled: true,
            filter_duplicates: params.filter_duplicates,
        });
        if status.is_ok() {
            let mut state = self.inner.state.lock().unwrap();
            state.role = BtRole::Master;
            state.policy = policy;
            state.scan_params = params;
            state.scan_type = if params.active {
                ScanType::LeActive
            } else {
                ScanType::LePassive
            };
            state.resume_pending = false;
            state.explicit_scan_stop = false;
            state.pausing_devices.clear();
        }
        status
    }

    /// Stops LE discovery. Idempotent.
    pub fn stop_discovery(&self) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::Failed;
        }
        let scanning = {
            let mut state = self.inner.state.lock().unwrap();
            state.explicit_scan_stop = true;
            state.resume_pending = false;
            state.pausing_devices.clear();
            state.scan_type != ScanType::None
        };
        if !scanning {
            return HciStatus::Success;
        }
        let status = self.inner.submit(HciCommand::SetScanEnable {
            enabled: false,
            filter_duplicates: false,
        });
        if status.is_ok() {
            self.inner.state.lock().unwrap().scan_type = ScanType::None;
        }
        status
    }

    /// Whether any discovery is active right now.
    ///
    /// Reports `false` while discovery is policy-paused around a connection.
    pub fn is_discovering(&self) -> bool {
        self.inner.state.lock().unwrap().scan_type != ScanType::None
    }

    /// The current meta scan type.
    pub fn scan_type(&self) -> ScanType {
        self.inner.state.lock().unwrap().scan_type
    }

    /// The discovery policy of the current/last discovery session.
    pub fn discovery_policy(&self) -> DiscoveryPolicy {
        self.inner.state.lock().unwrap().policy
    }

    // ---- advertising ----

    /// Freezes `db`, assigns attribute handles, and starts LE advertising
    /// with the given EIR selection. Forces the adapter role to `Slave`.
    ///
    /// The `LE_Gen_Disc` GAP flag and the adapter name are always emitted,
    /// regardless of the masks. Rejected while discovering or with open
    /// connections.
    pub fn start_advertising(
        &self,
        mut db: DbGattServer,
        mut eir: EInfoReport,
        adv_mask: EirDataType,
        scan_rsp_mask: EirDataType,
        params: AdvertisingParameters,
    ) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::Failed;
        }
        {
            let state = self.inner.state.lock().unwrap();
            if !state.settings.contains(AdapterSettings::POWERED) {
                return HciStatus::CommandDisallowed;
            }
            if state.scan_type != ScanType::None {
                return HciStatus::CommandDisallowed;
            }
        }
        if !self.inner.devices.lock().unwrap().connected.is_empty() {
            return HciStatus::CommandDisallowed;
        }
        let params = AdvertisingParameters {
            interval_min: params.interval_min.clamp(0x0020, 0x4000),
            interval_max: params
                .interval_max
                .clamp(params.interval_min.clamp(0x0020, 0x4000), 0x4000),
        };

        eir.add_flags(GapFlags::LE_GEN_DISC);
        if eir.name().is_none() {
            eir.set_name(self.name());
        }
        let mut adv_buf = [0u8; 31];
        let mut writer = crate::bytes::ByteWriter::new(&mut adv_buf);
        if eir
            .to_bytes(&mut writer, (adv_mask | EirDataType::FLAGS) - EirDataType::NAME)
            .is_err()
        {
            return HciStatus::InvalidParams;
        }
        let adv_len = writer.bytes_written();
        let mut rsp_buf = [0u8; 31];
        let mut writer = crate::bytes::ByteWriter::new(&mut rsp_buf);
        if eir
            .to_bytes(&mut writer, (scan_rsp_mask | EirDataType::NAME) - EirDataType::FLAGS)
            .is_err()
        {
            return HciStatus::InvalidParams;
        }
        let rsp_len = writer.bytes_written();

        db.assign_handles(1);
        let db = Arc::new(db);

        let status = self.inner.submit(HciCommand::SetAdvertisingParams(params));
        if !status.is_ok() {
            return status;
        }
        let status = self.inner.submit(HciCommand::SetAdvertisingData {
            data: adv_buf[..adv_len].to_vec(),
            scan_rsp: rsp_buf[..rsp_len].to_vec(),
        });
        if !status.is_ok() {
            return status;
        }
        let status = self.inner.submit(HciCommand::SetAdvertisingEnable(true));
        if status.is_ok() {
            let mut state = self.inner.state.lock().unwrap();
            state.role = BtRole::Slave;
            state.advertising = true;
            state.gatt_server = Some(db);
        }
        status
    }

    /// Stops LE advertising. Idempotent.
    pub fn stop_advertising(&self) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::Failed;
        }
        if !self.is_advertising() {
            return HciStatus::Success;
        }
        let status = self.inner.submit(HciCommand::SetAdvertisingEnable(false));
        if status.is_ok() {
            self.inner.state.lock().unwrap().advertising = false;
        }
        status
    }

    /// Whether LE advertising is active.
    pub fn is_advertising(&self) -> bool {
        self.inner.state.lock().unwrap().advertising
    }

    /// The frozen GATT server database of the current/last advertising
    /// session.
    pub fn gatt_server(&self) -> Option<Arc<DbGattServer>> {
        self.inner.state.lock().unwrap().gatt_server.clone()
    }

    // ---- whitelist ----

    /// Adds a peer to the controller whitelist. Duplicate entries (by typed
    /// address) are rejected.
    pub fn add_device_to_whitelist(&self, entry: WhitelistEntry) -> bool {
        {
            let state = self.inner.state.lock().unwrap();
            if state.whitelist.iter().any(|e| e.address == entry.address) {
                return false;
            }
        }
        if !self.inner.submit(HciCommand::WhitelistAdd(entry.address)).is_ok() {
            return false;
        }
        self.inner.state.lock().unwrap().whitelist.push(entry);
        true
    }

    /// Removes a peer from the controller whitelist.
    pub fn remove_device_from_whitelist(&self, address: &BDAddressAndType) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().unwrap();
            let before = state.whitelist.len();
            state.whitelist.retain(|e| e.address != *address);
            state.whitelist.len() != before
        };
        if removed {
            self.inner.submit(HciCommand::WhitelistRemove(*address));
        }
        removed
    }

    /// Clears the controller whitelist.
    pub fn clear_whitelist(&self) {
        self.inner.state.lock().unwrap().whitelist.clear();
        self.inner.submit(HciCommand::WhitelistClear);
    }

    /// The current whitelist.
    pub fn whitelist(&self) -> Vec<WhitelistEntry> {
        self.inner.state.lock().unwrap().whitelist.clone()
    }

    // ---- connection parameters ----

    /// Sets the default parameters for incoming peripheral-side
    /// connections. Only allowed while powered off; returns
    /// [`HciStatus::CommandDisallowed`] otherwise.
    pub fn set_default_conn_params(&self, params: DefaultConnectionParams) -> HciStatus {
        if self.is_powered() {
            return HciStatus::CommandDisallowed;
        }
        if !params.is_valid() {
            return HciStatus::InvalidParams;
        }
        let status = self.inner.submit(HciCommand::SetDefaultConnParams(params));
        if status.is_ok() {
            self.inner.state.lock().unwrap().default_conn_params = params;
        }
        status
    }

    /// The default parameters for incoming connections.
    pub fn default_conn_params(&self) -> DefaultConnectionParams {
        self.inner.state.lock().unwrap().default_conn_params
    }

    // ---- devices ----

    /// Devices seen by the current discovery session and retained by a
    /// listener.
    pub fn discovered_devices(&self) -> Vec<Device> {
        self.inner.devices.lock().unwrap().discovered.clone()
    }

    /// Currently connected devices.
    pub fn connected_devices(&self) -> Vec<Device> {
        self.inner.devices.lock().unwrap().connected.clone()
    }

    /// Looks up a tracked device by typed address.
    pub fn find_device(&self, address: &BDAddressAndType) -> Option<Device> {
        self.inner.devices.lock().unwrap().find(address)
    }

    // ---- listeners ----

    /// Attaches a status listener; identity based, `false` if this instance
    /// is already attached. The new listener receives one synthetic
    /// `adapter_settings_changed` reporting the current settings.
    pub fn add_status_listener(&self, listener: Arc<dyn AdapterStatusListener>) -> bool {
        if !self.inner.listeners.add(listener.clone()) {
            return false;
        }
        if let Some(dispatcher) = self.inner.dispatcher.lock().unwrap().as_ref() {
            let _ = dispatcher.tx.send(InternalMsg::InitialSettings(listener));
        }
        true
    }

    /// Detaches a status listener.
    pub fn remove_status_listener(&self, listener: &Arc<dyn AdapterStatusListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Detaches all status listeners, returning the count.
    pub fn remove_all_status_listeners(&self) -> usize {
        self.inner.listeners.clear()
    }

    /// Number of attached status listeners.
    pub fn status_listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Shuts the adapter down: stops discovery and advertising, drops all
    /// devices and stops the dispatch thread after draining pending events.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl AdapterInner {
    pub(crate) fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub(crate) fn controller(&self) -> &Arc<dyn HciController> {
        &self.controller
    }

    pub(crate) fn address_and_type(&self) -> BDAddressAndType {
        self.address
    }

    fn as_adapter(&self) -> Adapter {
        Adapter {
            inner: self.self_arc(),
        }
    }

    fn self_arc(&self) -> Arc<AdapterInner> {
        self.weak_self.upgrade().expect("self_arc on dropped adapter")
    }

    /// Serialized command submission: at most one command in flight.
    pub(crate) fn submit(&self, cmd: HciCommand) -> HciStatus {
        let _guard = self.cmd_lock.lock().unwrap();
        self.controller.submit(cmd)
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.controller.submit(HciCommand::SetScanEnable {
            enabled: false,
            filter_duplicates: false,
        });
        let _ = self.controller.submit(HciCommand::SetAdvertisingEnable(false));

        let dispatcher = self.dispatcher.lock().unwrap().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.tx.send(InternalMsg::Shutdown);
            if dispatcher.handle.thread().id() != std::thread::current().id() {
                let _ = dispatcher.handle.join();
            }
        }

        let mut devices = self.devices.lock().unwrap();
        devices.discovered.clear();
        devices.connected.clear();
        devices.shared.clear();
        debug!(dev_id = self.dev_id, "adapter closed");
    }

    fn load_smp_keys(&self) {
        let path = self.state.lock().unwrap().key_path.clone();
        let Some(path) = path else { return };
        let records = SmpKeyBin::read_all(&path);
        info!(dev_id = self.dev_id, count = records.len(), dir = %path.display(), "loaded SMP key records");
        for record in &records {
            for dir in [KeyDirection::Initiator, KeyDirection::Responder] {
                if let Some(ltk) = record.long_term_key(dir) {
                    self.submit(HciCommand::UploadLongTermKey {
                        peer: record.remote_address(),
                        ltk,
                    });
                }
            }
        }
        self.state.lock().unwrap().key_cache = records;
    }

    /// Issues an LE connection for `device`, pausing discovery first.
    pub(crate) fn connect_device(
        &self,
        device: &Device,
        params: crate::hci::ConnectionParameters,
        sec_level: BtSecurityLevel,
        io_cap: SmpIoCapability,
    ) -> HciStatus {
        if self.closed.load(Ordering::Acquire) || self.invalidated.load(Ordering::Acquire) {
            return HciStatus::Failed;
        }
        {
            let state = self.state.lock().unwrap();
            if !state.settings.contains(AdapterSettings::POWERED) {
                return HciStatus::CommandDisallowed;
            }
        }
        self.pause_discovery_for_connect();
        let status = self.submit(HciCommand::SetSecurity {
            peer: device.address_and_type(),
            level: sec_level,
            io_cap,
        });
        if !status.is_ok() {
            return status;
        }
        self.submit(HciCommand::CreateConnection {
            peer: device.address_and_type(),
            params,
        })
    }

    /// Stops scanning ahead of a connection attempt; the discovery policy
    /// decides when to resume.
    fn pause_discovery_for_connect(&self) {
        let scanning = {
            let state = self.state.lock().unwrap();
            state.scan_type != ScanType::None
        };
        if !scanning {
            return;
        }
        let status = self.submit(HciCommand::SetScanEnable {
            enabled: false,
            filter_duplicates: false,
        });
        if status.is_ok() {
            let mut state = self.state.lock().unwrap();
            state.scan_type = ScanType::None;
            if state.policy != DiscoveryPolicy::AutoOff {
                state.resume_pending = true;
            }
        }
    }

    /// Removes `device` from every collection; idempotent.
    pub(crate) fn evict_device(&self, device: &Device) {
        self.devices.lock().unwrap().remove_everywhere(device);
        self.release_pausing_device(&device.address_and_type(), PauseRelease::Disconnected);
    }

    pub(crate) fn deliver_initial_settings(
        &self,
        listener: &Arc<dyn AdapterStatusListener>,
    ) {
        let adapter = self.as_adapter();
        let settings = self.state.lock().unwrap().settings;
        shielded("adapter_settings_changed", || {
            listener.adapter_settings_changed(
                &adapter,
                AdapterSettings::empty(),
                AdapterSettings::empty(),
                settings,
                monotonic_ms(),
            )
        });
    }

    // ---- event engine (dispatch thread only) ----

    pub(crate) fn handle_event(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::SettingsChanged {
                settings,
                timestamp,
            } => self.handle_settings(settings, timestamp),
            ControllerEvent::DiscoveringChanged {
                scan_type,
                enabled,
                controller_initiated,
                timestamp,
            } => self.handle_discovering(scan_type, enabled, controller_initiated, timestamp),
            ControllerEvent::DeviceFound {
                address,
                source,
                data,
                rssi,
                timestamp,
            } => self.handle_device_found(address, source, &data, rssi, timestamp),
            ControllerEvent::Connected {
                address,
                handle,
                incoming,
                timestamp,
            } => self.handle_connected(address, handle, incoming, timestamp),
            ControllerEvent::ConnectFailed {
                address,
                status,
                timestamp,
            } => self.handle_connect_failed(address, status, timestamp),
            ControllerEvent::Disconnected {
                address,
                handle,
                reason,
                timestamp,
            } => self.handle_disconnected(address, handle, reason, timestamp),
            ControllerEvent::PairingState {
                address,
                state,
                mode,
                status,
                timestamp,
            } => self.handle_pairing_state(address, state, mode, status, timestamp),
            ControllerEvent::KeysDistributed {
                address,
                direction,
                keys,
                ..
            } => self.handle_keys(address, direction, keys),
            ControllerEvent::MtuChanged {
                address,
                mtu,
                timestamp: _,
            } => self.handle_mtu(address, mtu),
            ControllerEvent::Notification {
                address,
                value_handle,
                value,
                timestamp,
            } => {
                if let Some(device) = self.devices.lock().unwrap().find(&address) {
                    device.deliver_char_value(value_handle, &value, timestamp, None);
                }
            }
            ControllerEvent::Indication {
                address,
                value_handle,
                value,
                confirmation_sent,
                timestamp,
            } => {
                if let Some(device) = self.devices.lock().unwrap().find(&address) {
                    device.deliver_char_value(
                        value_handle,
                        &value,
                        timestamp,
                        Some(confirmation_sent),
                    );
                }
            }
            ControllerEvent::ServerWrite {
                address,
                handle,
                value,
                offset,
                with_response: _,
                timestamp: _,
            } => self.handle_server_write(address, handle, &value, offset),
            ControllerEvent::PhyUpdated {
                address,
                tx,
                rx,
                timestamp,
            } => {
                if let Some(device) = self.devices.lock().unwrap().find(&address) {
                    let mut state = device.inner.state.lock().unwrap();
                    state.phy_tx = tx;
                    state.phy_rx = rx;
                    state.ts_last_update = timestamp;
                }
            }
            ControllerEvent::ControllerError { status, timestamp } => {
                self.handle_controller_error(status, timestamp)
            }
        }
    }

    fn handle_settings(&self, settings: AdapterSettings, ts: u64) {
        let (old, changed) = {
            let mut state = self.state.lock().unwrap();
            let old = state.settings;
            state.settings = settings;
            (old, old ^ settings)
        };
        if changed.is_empty() {
            return;
        }
        let adapter = self.as_adapter();
        for listener in self.listeners.snapshot() {
            shielded("adapter_settings_changed", || {
                listener.adapter_settings_changed(&adapter, old, changed, settings, ts)
            });
        }
    }

    fn handle_discovering(
        &self,
        scan_type: ScanType,
        enabled: bool,
        controller_initiated: bool,
        ts: u64,
    ) {
        let (current, policy, restart) = {
            let mut state = self.state.lock().unwrap();
            state.scan_type = if enabled { scan_type } else { ScanType::None };
            let restart = !enabled
                && controller_initiated
                && state.policy == DiscoveryPolicy::AlwaysOn
                && !state.explicit_scan_stop
                && state.settings.contains(AdapterSettings::POWERED);
            (state.scan_type, state.policy, restart)
        };
        if restart {
            debug!(dev_id = self.dev_id, "eagerly restarting paused discovery");
            let filter_duplicates = self.state.lock().unwrap().scan_params.filter_duplicates;
            let status = self.submit(HciCommand::SetScanEnable {
                enabled: true,
                filter_duplicates,
            });
            if status.is_ok() {
                let mut state = self.state.lock().unwrap();
                state.scan_type = if state.scan_params.active {
                    ScanType::LeActive
                } else {
                    ScanType::LePassive
                };
            }
        }
        let adapter = self.as_adapter();
        for listener in self.listeners.snapshot() {
            shielded("discovering_changed", || {
                listener.discovering_changed(&adapter, current, scan_type, enabled, policy, ts)
            });
        }
    }

    fn handle_device_found(
        &self,
        address: BDAddressAndType,
        source: crate::eir::EirSource,
        data: &[u8],
        rssi: i8,
        ts: u64,
    ) {
        let mut report = EInfoReport::new(source, ts);
        if report.read_data(data).is_err() {
            warn!(dev_id = self.dev_id, %address, "malformed advertising data");
            return;
        }
        report.set_address(address.address);
        report.set_address_type(address.address_type);
        report.set_rssi(rssi);

        if let Some(device) = self.devices.lock().unwrap().find(&address) {
            let changed = device.update_from_eir(&report);
            if !changed.is_empty() {
                for listener in self.listeners.snapshot() {
                    shielded("device_updated", || {
                        listener.device_updated(&device, changed, ts)
                    });
                }
            }
            return;
        }

        let device = Device::new(&self.self_arc(), address);
        device.update_from_eir(&report);

        let keybin = {
            let state = self.state.lock().unwrap();
            state
                .key_cache
                .iter()
                .find(|k| k.remote_address().matches(&address))
                .copied()
        };
        if let Some(keybin) = keybin {
            let status = keybin.apply(&device);
            debug!(device = %device, %status, "applied persisted keys");
        }

        let mut owned = false;
        for listener in self.listeners.snapshot() {
            owned |= shielded("device_found", || listener.device_found(&device, ts))
                .unwrap_or(false);
        }
        if owned {
            let mut devices = self.devices.lock().unwrap();
            devices.discovered.push(device.clone());
            devices.shared.push(device);
        }
        // Without an owner the device is discarded.
    }

    fn handle_connected(&self, address: BDAddressAndType, handle: u16, incoming: bool, ts: u64) {
        let device = match self.devices.lock().unwrap().find(&address) {
            Some(device) => device,
            None => {
                let device = Device::new(&self.self_arc(), address);
                let mut devices = self.devices.lock().unwrap();
                devices.shared.push(device.clone());
                device
            }
        };
        let discovered = self
            .devices
            .lock()
            .unwrap()
            .discovered
            .iter()
            .any(|d| d == &device);
        {
            let mut devices = self.devices.lock().unwrap();
            if !devices.connected.iter().any(|d| d == &device) {
                devices.connected.push(device.clone());
            }
        }
        let remote_role = if incoming { BtRole::Master } else { BtRole::Slave };
        device.set_connected(handle, remote_role, ts);

        if incoming {
            // Legacy advertising stops once a central connects.
            self.state.lock().unwrap().advertising = false;
        }

        self.apply_pause_policy(&address);

        let (deferred, no_security) = {
            let mut state = device.inner.state.lock().unwrap();
            // While auto security iterates, the connected event is owed to
            // listeners only once the descent settles.
            let deferred = state.suppress_events || state.auto_sec;
            if deferred {
                state.pending_connected = Some(discovered);
            }
            (deferred, state.sec_level_user <= BtSecurityLevel::None)
        };
        if !deferred {
            for listener in self.listeners.snapshot() {
                shielded("device_connected", || {
                    listener.device_connected(&device, discovered, ts)
                });
            }
        }

        if incoming {
            if let Some(server) = self.state.lock().unwrap().gatt_server.clone() {
                server.fan_connected(&device, device.att_mtu());
            }
        }

        if no_security {
            // No SMP exchange will follow; a running auto security descent
            // has settled on its lowest rung.
            self.flush_pending_connected(&device, ts);
            device.inner.state.lock().unwrap().auto_sec = false;
            self.fire_ready(&device, ts);
        }
    }

    fn apply_pause_policy(&self, address: &BDAddressAndType) {
        enum Action {
            None,
            Pause,
            ResumeEagerly,
        }
        let action = {
            let mut state = self.state.lock().unwrap();
            match state.policy {
                DiscoveryPolicy::AutoOff => {
                    state.resume_pending = false;
                    if state.scan_type != ScanType::None {
                        Action::Pause
                    } else {
                        Action::None
                    }
                }
                DiscoveryPolicy::AlwaysOn => {
                    // Resume right away if the connect attempt paused us.
                    if state.resume_pending && state.scan_type == ScanType::None {
                        Action::ResumeEagerly
                    } else {
                        Action::None
                    }
                }
                _ => {
                    if !state.pausing_devices.contains(address) {
                        state.pausing_devices.push(*address);
                    }
                    // A connect attempt that paused discovery already set
                    // resume_pending; without an active or paused discovery
                    // there is nothing to resume later.
                    if state.scan_type != ScanType::None {
                        state.resume_pending = true;
                        Action::Pause
                    } else {
                        Action::None
                    }
                }
            }
        };
        match action {
            Action::None => {}
            Action::Pause => {
                let status = self.submit(HciCommand::SetScanEnable {
                    enabled: false,
                    filter_duplicates: false,
                });
                if status.is_ok() {
                    self.state.lock().unwrap().scan_type = ScanType::None;
                }
            }
            Action::ResumeEagerly => {
                let filter_duplicates =
                    self.state.lock().unwrap().scan_params.filter_duplicates;
                let status = self.submit(HciCommand::SetScanEnable {
                    enabled: true,
                    filter_duplicates,
                });
                if status.is_ok() {
                    let mut state = self.state.lock().unwrap();
                    state.resume_pending = false;
                    state.scan_type = if state.scan_params.active {
                        ScanType::LeActive
                    } else {
                        ScanType::LePassive
                    };
                }
            }
        }
    }

    /// Removes `address` from the pausing queue when `release` satisfies the
    /// policy, resuming discovery once the queue is empty.
    fn release_pausing_device(&self, address: &BDAddressAndType, release: PauseRelease) {
        let resume = {
            let mut state = self.state.lock().unwrap();
            let applies = match state.policy {
                DiscoveryPolicy::PauseConnectedUntilDisconnected => {
                    release == PauseRelease::Disconnected
                }
                DiscoveryPolicy::PauseConnectedUntilReady => matches!(
                    release,
                    PauseRelease::Ready | PauseRelease::Disconnected
                ),
                DiscoveryPolicy::PauseConnectedUntilPaired => true,
                _ => true,
            };
            if !applies {
                false
            } else {
                state.pausing_devices.retain(|a| a != address);
                state.pausing_devices.is_empty()
                    && state.resume_pending
                    && !state.explicit_scan_stop
            }
        };
        if !resume {
            return;
        }
        let filter_duplicates = self.state.lock().unwrap().scan_params.filter_duplicates;
        let status = self.submit(HciCommand::SetScanEnable {
            enabled: true,
            filter_duplicates,
        });
        if status.is_ok() {
            let mut state = self.state.lock().unwrap();
            state.resume_pending = false;
            state.scan_type = if state.scan_params.active {
                ScanType::LeActive
            } else {
                ScanType::LePassive
            };
        }
    }

    fn flush_pending_connected(&self, device: &Device, ts: u64) {
        let pending = {
            let mut state = device.inner.state.lock().unwrap();
            let pending = state.pending_connected.take();
            if pending.is_some() {
                state.suppress_events = false;
            }
            pending
        };
        if let Some(discovered) = pending {
            for listener in self.listeners.snapshot() {
                shielded("device_connected", || {
                    listener.device_connected(device, discovered, ts)
                });
            }
        }
    }

    fn fire_ready(&self, device: &Device, ts: u64) {
        {
            let mut state = device.inner.state.lock().unwrap();
            if state.ready_fired || state.handle == 0 {
                return;
            }
            state.ready_fired = true;
        }
        for listener in self.listeners.snapshot() {
            // device_ready is the one callback allowed to block.
            shielded("device_ready", || listener.device_ready(device, ts));
        }
        self.release_pausing_device(&device.address_and_type(), PauseRelease::Ready);
    }

    fn handle_connect_failed(
        &self,
        address: BDAddressAndType,
        status: HciStatus,
        ts: u64,
    ) {
        let device = match self.devices.lock().unwrap().find(&address) {
            Some(device) => device,
            None => return,
        };
        if self.advance_auto_sec(&device, false) {
            return;
        }
        self.flush_pending_connected(&device, ts);
        for listener in self.listeners.snapshot() {
            shielded("device_disconnected", || {
                listener.device_disconnected(&device, status, 0, ts)
            });
        }
        self.release_pausing_device(&address, PauseRelease::Disconnected);
    }

    fn handle_disconnected(
        &self,
        address: BDAddressAndType,
        handle: u16,
        reason: HciStatus,
        ts: u64,
    ) {
        let device = match self.devices.lock().unwrap().find(&address) {
            Some(device) => device,
            None => return, // removed devices drop their trailing events
        };
        {
            let mut devices = self.devices.lock().unwrap();
            devices.connected.retain(|d| d != &device);
        }
        let was_server_client = device.role() == BtRole::Master;
        let retry = device.inner.state.lock().unwrap().suppress_events;
        device.set_disconnected(ts);

        if retry {
            // Auto security descent: reconnect with the lowered requirement.
            let (params, level, io_cap, peer) = {
                let state = device.inner.state.lock().unwrap();
                (
                    state.conn_params,
                    state.sec_level_user,
                    state.io_cap_user,
                    device.address_and_type(),
                )
            };
            self.submit(HciCommand::SetSecurity {
                peer,
                level,
                io_cap,
            });
            self.submit(HciCommand::CreateConnection { peer, params });
            return;
        }

        if was_server_client {
            if let Some(server) = self.state.lock().unwrap().gatt_server.clone() {
                server.fan_disconnected(&device);
            }
        }
        self.flush_pending_connected(&device, ts);
        for listener in self.listeners.snapshot() {
            shielded("device_disconnected", || {
                listener.device_disconnected(&device, reason, handle, ts)
            });
        }
        self.release_pausing_device(&address, PauseRelease::Disconnected);
    }

    /// Moves to the next auto-security rung after a failure. Returns `true`
    /// when a retry was scheduled and events must stay suppressed.
    fn advance_auto_sec(&self, device: &Device, connected: bool) -> bool {
        let next = {
            let mut state = device.inner.state.lock().unwrap();
            if !state.auto_sec || state.auto_sec_index + 1 >= 4 {
                None
            } else {
                state.auto_sec_index += 1;
                let ladder = crate::device::auto_sec_ladder(state.auto_sec_io_cap);
                let rung = ladder[state.auto_sec_index];
                (state.sec_level_user, state.io_cap_user) = rung;
                state.suppress_events = true;
                Some(rung)
            }
        };
        let Some((level, _)) = next else { return false };
        debug!(device = %device, ?level, "auto security descending");
        if connected {
            self.submit(HciCommand::Disconnect {
                peer: device.address_and_type(),
                reason: HciStatus::AuthenticationFailure,
            });
            // The reconnect is issued when the disconnect completes.
        } else {
            let (params, level, io_cap) = {
                let state = device.inner.state.lock().unwrap();
                (state.conn_params, state.sec_level_user, state.io_cap_user)
            };
            let peer = device.address_and_type();
            self.submit(HciCommand::SetSecurity {
                peer,
                level,
                io_cap,
            });
            self.submit(HciCommand::CreateConnection { peer, params });
        }
        true
    }

    fn handle_pairing_state(
        &self,
        address: BDAddressAndType,
        new_state: SmpPairingState,
        mode: PairingMode,
        status: HciStatus,
        ts: u64,
    ) {
        let device = match self.devices.lock().unwrap().find(&address) {
            Some(device) => device,
            None => return,
        };
        device.set_pairing(new_state, mode, ts);

        match new_state {
            SmpPairingState::Completed => {
                self.flush_pending_connected(&device, ts);
                {
                    let mut state = device.inner.state.lock().unwrap();
                    state.suppress_events = false;
                    state.auto_sec = false;
                }
                let mode = device.pairing_mode();
                for listener in self.listeners.snapshot() {
                    shielded("device_pairing_state", || {
                        listener.device_pairing_state(&device, new_state, mode, ts)
                    });
                }
                self.store_bonded_keys(&device);
                self.fire_ready(&device, ts);
                self.release_pausing_device(&address, PauseRelease::Paired);
            }
            SmpPairingState::Failed => {
                if self.advance_auto_sec(&device, device.is_connected()) {
                    return;
                }
                self.flush_pending_connected(&device, ts);
                debug!(device = %device, %status, "pairing failed");
                for listener in self.listeners.snapshot() {
                    shielded("device_pairing_state", || {
                        listener.device_pairing_state(&device, new_state, mode, ts)
                    });
                }
            }
            _ => {
                if device.inner.state.lock().unwrap().suppress_events {
                    return;
                }
                self.flush_pending_connected(&device, ts);
                for listener in self.listeners.snapshot() {
                    shielded("device_pairing_state", || {
                        listener.device_pairing_state(&device, new_state, mode, ts)
                    });
                }
            }
        }
    }

    /// Persists freshly bonded keys when acting as peripheral and a key path
    /// is configured.
    fn store_bonded_keys(&self, device: &Device) {
        let path = {
            let state = self.state.lock().unwrap();
            state.key_path.clone()
        };
        let Some(path) = path else { return };
        if device.role() != BtRole::Master {
            return;
        }
        let keybin = SmpKeyBin::create(device);
        if !keybin.is_valid() {
            return;
        }
        if let Err(err) = keybin.write(keybin.file_path(&path), true) {
            warn!(device = %device, %err, "failed to persist bonded keys");
        } else {
            let mut state = self.state.lock().unwrap();
            state
                .key_cache
                .retain(|k| !k.remote_address().matches(&keybin.remote_address()));
            state.key_cache.push(keybin);
        }
    }

    fn handle_keys(&self, address: BDAddressAndType, dir: KeyDirection, keys: DistributedKeys) {
        if let Some(device) = self.devices.lock().unwrap().find(&address) {
            device.store_keys(dir, &keys);
        }
    }

    fn handle_mtu(&self, address: BDAddressAndType, mtu: u16) {
        let device = match self.devices.lock().unwrap().find(&address) {
            Some(device) => device,
            None => return,
        };
        device.inner.state.lock().unwrap().mtu = mtu;
        if device.role() == BtRole::Master {
            if let Some(server) = self.state.lock().unwrap().gatt_server.clone() {
                server.fan_mtu_changed(&device, mtu);
            }
        }
    }

    fn handle_server_write(
        &self,
        address: BDAddressAndType,
        handle: u16,
        value: &[u8],
        offset: u16,
    ) {
        let server = match self.state.lock().unwrap().gatt_server.clone() {
            Some(server) => server,
            None => return,
        };
        let device = match self.devices.lock().unwrap().find(&address) {
            Some(device) => device,
            None => return,
        };
        if let Some((service, characteristic)) = server.find_char_by_value_handle(handle) {
            if server.authorize_write_char(&device, service, characteristic, value, offset)
                && characteristic.write_value(value, offset as usize)
            {
                server.fan_write_char_done(&device, service, characteristic);
            }
        } else if let Some((service, characteristic, descriptor)) =
            server.find_desc_by_handle(handle)
        {
            if server.authorize_write_desc(
                &device,
                service,
                characteristic,
                descriptor,
                value,
                offset,
            ) && descriptor.write_value(value, offset as usize)
            {
                server.fan_write_desc_done(&device, service, characteristic, descriptor);
                if descriptor.is_cccd() {
                    let bits = descriptor.value();
                    let cccd = u16::from_le_bytes([
                        bits.first().copied().unwrap_or(0),
                        bits.get(1).copied().unwrap_or(0),
                    ]);
                    server.fan_cccd_changed(
                        &device,
                        service,
                        characteristic,
                        descriptor,
                        cccd & 0x0001 != 0,
                        cccd & 0x0002 != 0,
                    );
                }
            }
        }
    }

    fn handle_controller_error(&self, status: HciStatus, ts: u64) {
        warn!(dev_id = self.dev_id, %status, "fatal controller error, invalidating adapter");
        self.invalidated.store(true, Ordering::Release);
        let connected = {
            let mut devices = self.devices.lock().unwrap();
            let connected = std::mem::take(&mut devices.connected);
            devices.discovered.clear();
            devices.shared.clear();
            connected
        };
        for device in connected {
            let handle = device.connection_handle();
            device.set_disconnected(ts);
            for listener in self.listeners.snapshot() {
                shielded("device_disconnected", || {
                    listener.device_disconnected(&device, status, handle, ts)
                });
            }
        }
    }
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        // Safety net only: report the leak, do not attempt cleanup here.
        if !self.closed.load(Ordering::Acquire) {
            warn!(
                dev_id = self.dev_id,
                "adapter dropped without close(), dispatch thread leaked"
            );
        }
    }
}
