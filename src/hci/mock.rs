//! A scriptable in-process controller.
//!
//! [`MockController`] implements [`HciController`] against a table of
//! scripted remote peers: their advertising payloads, GATT databases and
//! pairing behavior. Commands complete synchronously and completion events
//! are queued in the order the corresponding controller would emit them,
//! honoring the stack's ordering contract. This is the backend the
//! test-suite runs on; downstream crates can use it the same way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::adapter::AdapterSettings;
use crate::address::BDAddressAndType;
use crate::eir::EirSource;
use crate::error::{Error, ErrorKind};
use crate::hci::{
    ControllerEvent, DistributedKeys, GattServiceDef, HciCommand, HciController, HciHost,
    HciStatus, HotplugEvent, LeFeatures,
};
use crate::smp::{
    BtSecurityLevel, KeyDirection, PairingMode, SmpIdentityResolvingKey, SmpIoCapability,
    SmpLongTermKey, SmpLtkProperties, SmpPairingState,
};
use crate::util::monotonic_ms;
use crate::{LePhy, Result, ScanType};

/// How a scripted peer behaves when pairing is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingScript {
    /// The peer accepts any unauthenticated pairing without interaction.
    JustWorks,
    /// The peer requires this six-digit passkey.
    Passkey(u32),
    /// The peer requires numeric comparison of this value.
    NumericComparison(u32),
}

/// A scripted remote peer.
pub struct MockPeer {
    /// The peer's identity.
    pub address: BDAddressAndType,
    /// Advertising payload (AD structure TLVs).
    pub adv_data: Vec<u8>,
    /// Scan-response payload, delivered during active scanning.
    pub scan_rsp: Vec<u8>,
    /// The peer's GATT database as discovery reports it.
    pub gatt: Vec<GattServiceDef>,
    /// Initial attribute values by handle.
    pub values: HashMap<u16, Vec<u8>>,
    /// Pairing behavior.
    pub pairing: PairingScript,
    /// Highest security level the peer supports; higher requests fail
    /// pairing.
    pub max_sec_level: BtSecurityLevel,
}

impl MockPeer {
    /// A connectable peer with no advertising payload and no GATT database.
    pub fn new(address: BDAddressAndType) -> Self {
        MockPeer {
            address,
            adv_data: Vec::new(),
            scan_rsp: Vec::new(),
            gatt: Vec::new(),
            values: HashMap::new(),
            pairing: PairingScript::JustWorks,
            max_sec_level: BtSecurityLevel::EncAuthFips,
        }
    }
}

enum PendingPairing {
    Passkey(u32),
    NumericComparison,
}

#[derive(Default)]
struct CtrlState {
    powered: bool,
    settings: AdapterSettings,
    scanning: bool,
    scan_active: bool,
    advertising: bool,
    peers: HashMap<BDAddressAndType, MockPeer>,
    connections: HashMap<BDAddressAndType, u16>,
    next_handle: u16,
    att_values: HashMap<(BDAddressAndType, u16), Vec<u8>>,
    uploaded_ltks: HashMap<BDAddressAndType, Vec<SmpLongTermKey>>,
    security: HashMap<BDAddressAndType, (BtSecurityLevel, SmpIoCapability)>,
    pending_pairing: HashMap<BDAddressAndType, PendingPairing>,
    pairing_in_progress: HashMap<BDAddressAndType, PairingMode>,
}

/// See the [module documentation][self].
pub struct MockController {
    dev_id: u16,
    address: BDAddressAndType,
    name: Mutex<String>,
    tx: Sender<ControllerEvent>,
    rx: Receiver<ControllerEvent>,
    state: Mutex<CtrlState>,
    commands: Mutex<Vec<HciCommand>>,
}

impl MockController {
    /// Creates a controller with the given index and identity address.
    pub fn new(dev_id: u16, address: BDAddressAndType) -> Arc<MockController> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(MockController {
            dev_id,
            address,
            name: Mutex::new(format!("mock-{dev_id}")),
            tx,
            rx,
            state: Mutex::new(CtrlState {
                next_handle: 0x0040,
                ..Default::default()
            }),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Registers a scripted peer.
    pub fn add_peer(&self, peer: MockPeer) {
        let mut state = self.state.lock().unwrap();
        for (handle, value) in &peer.values {
            state
                .att_values
                .insert((peer.address, *handle), value.clone());
        }
        state.peers.insert(peer.address, peer);
    }

    /// Every command submitted so far, in order.
    pub fn submitted_commands(&self) -> Vec<HciCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.tx.send(event);
    }

    fn deterministic_keys(address: &BDAddressAndType, responder: bool) -> DistributedKeys {
        let b = address.address.b;
        let mut ltk = [0u8; 16];
        let mut irk = [0u8; 16];
        for i in 0..16 {
            ltk[i] = b[i % 6] ^ (i as u8) ^ u8::from(responder);
            irk[i] = b[(i + 3) % 6].wrapping_add(i as u8);
        }
        DistributedKeys {
            ltk: Some(SmpLongTermKey {
                properties: if responder {
                    SmpLtkProperties::RESPONDER
                } else {
                    SmpLtkProperties::empty()
                },
                enc_size: 16,
                ediv: u16::from_le_bytes([b[0], b[1]]),
                rand: u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0]),
                ltk,
            }),
            irk: Some(SmpIdentityResolvingKey {
                properties: Default::default(),
                irk,
            }),
            csrk: None,
            lk: None,
        }
    }

    fn pairing_success(&self, peer: BDAddressAndType, mode: PairingMode) {
        let ts = monotonic_ms();
        self.emit(ControllerEvent::PairingState {
            address: peer,
            state: SmpPairingState::KeyDistribution,
            mode,
            status: HciStatus::Success,
            timestamp: ts,
        });
        self.emit(ControllerEvent::KeysDistributed {
            address: peer,
            direction: KeyDirection::Initiator,
            keys: Self::deterministic_keys(&peer, false),
            timestamp: ts,
        });
        self.emit(ControllerEvent::KeysDistributed {
            address: peer,
            direction: KeyDirection::Responder,
            keys: Self::deterministic_keys(&peer, true),
            timestamp: ts,
        });
        self.state.lock().unwrap().pairing_in_progress.remove(&peer);
        self.emit(ControllerEvent::PairingState {
            address: peer,
            state: SmpPairingState::Completed,
            mode,
            status: HciStatus::Success,
            timestamp: monotonic_ms(),
        });
    }

    fn pairing_failure(&self, peer: BDAddressAndType, mode: PairingMode, status: HciStatus) {
        {
            let mut state = self.state.lock().unwrap();
            state.pairing_in_progress.remove(&peer);
            state.pending_pairing.remove(&peer);
        }
        self.emit(ControllerEvent::PairingState {
            address: peer,
            state: SmpPairingState::Failed,
            mode,
            status,
            timestamp: monotonic_ms(),
        });
    }

    fn begin_pairing(&self, peer_addr: BDAddressAndType) {
        let ts = monotonic_ms();
        let (requested, script, max_level, pre_paired) = {
            let state = self.state.lock().unwrap();
            let peer = match state.peers.get(&peer_addr) {
                Some(peer) => (peer.pairing, peer.max_sec_level),
                None => (PairingScript::JustWorks, BtSecurityLevel::EncAuthFips),
            };
            (
                state
                    .security
                    .get(&peer_addr)
                    .copied()
                    .unwrap_or((BtSecurityLevel::Unset, SmpIoCapability::Unset)),
                peer.0,
                peer.1,
                state
                    .uploaded_ltks
                    .get(&peer_addr)
                    .is_some_and(|keys| !keys.is_empty()),
            )
        };

        if pre_paired {
            // Link comes up encrypted from the uploaded keys, SMP skipped.
            self.emit(ControllerEvent::PairingState {
                address: peer_addr,
                state: SmpPairingState::Completed,
                mode: PairingMode::PrePaired,
                status: HciStatus::Success,
                timestamp: ts,
            });
            return;
        }
        if requested.0 <= BtSecurityLevel::None {
            return;
        }

        self.state
            .lock()
            .unwrap()
            .pairing_in_progress
            .insert(peer_addr, PairingMode::Negotiating);
        self.emit(ControllerEvent::PairingState {
            address: peer_addr,
            state: SmpPairingState::FeatureExchangeStarted,
            mode: PairingMode::Negotiating,
            status: HciStatus::Success,
            timestamp: ts,
        });

        if requested.0 > max_level {
            self.pairing_failure(
                peer_addr,
                PairingMode::Negotiating,
                HciStatus::AuthenticationFailure,
            );
            return;
        }

        match script {
            PairingScript::JustWorks => {
                self.emit(ControllerEvent::PairingState {
                    address: peer_addr,
                    state: SmpPairingState::FeatureExchangeCompleted,
                    mode: PairingMode::JustWorks,
                    status: HciStatus::Success,
                    timestamp: monotonic_ms(),
                });
                self.pairing_success(peer_addr, PairingMode::JustWorks);
            }
            PairingScript::Passkey(passkey) => {
                self.emit(ControllerEvent::PairingState {
                    address: peer_addr,
                    state: SmpPairingState::FeatureExchangeCompleted,
                    mode: PairingMode::PasskeyEntryIni,
                    status: HciStatus::Success,
                    timestamp: monotonic_ms(),
                });
                self.state
                    .lock()
                    .unwrap()
                    .pending_pairing
                    .insert(peer_addr, PendingPairing::Passkey(passkey));
                self.emit(ControllerEvent::PairingState {
                    address: peer_addr,
                    state: SmpPairingState::PasskeyExpected,
                    mode: PairingMode::PasskeyEntryIni,
                    status: HciStatus::Success,
                    timestamp: monotonic_ms(),
                });
            }
            PairingScript::NumericComparison(_) => {
                self.emit(ControllerEvent::PairingState {
                    address: peer_addr,
                    state: SmpPairingState::FeatureExchangeCompleted,
                    mode: PairingMode::NumericCompareIni,
                    status: HciStatus::Success,
                    timestamp: monotonic_ms(),
                });
                self.state
                    .lock()
                    .unwrap()
                    .pending_pairing
                    .insert(peer_addr, PendingPairing::NumericComparison);
                self.emit(ControllerEvent::PairingState {
                    address: peer_addr,
                    state: SmpPairingState::NumericCompareExpected,
                    mode: PairingMode::NumericCompareIni,
                    status: HciStatus::Success,
                    timestamp: monotonic_ms(),
                });
            }
        }
    }

    // ---- test drivers ----

    /// Injects a settings change, as a controller would report it.
    pub fn inject_settings(&self, settings: AdapterSettings) {
        self.state.lock().unwrap().settings = settings;
        self.emit(ControllerEvent::SettingsChanged {
            settings,
            timestamp: monotonic_ms(),
        });
    }

    /// A remote central connects to the (advertising) local adapter.
    ///
    /// Returns the connection handle.
    pub fn central_connect(&self, central: BDAddressAndType) -> u16 {
        let handle = {
            let mut state = self.state.lock().unwrap();
            let handle = state.next_handle;
            state.next_handle += 1;
            state.connections.insert(central, handle);
            state.advertising = false;
            handle
        };
        self.emit(ControllerEvent::Connected {
            address: central,
            handle,
            incoming: true,
            timestamp: monotonic_ms(),
        });
        handle
    }

    /// A remote central drops its connection.
    pub fn central_disconnect(&self, central: BDAddressAndType, reason: HciStatus) {
        let handle = self.state.lock().unwrap().connections.remove(&central);
        if let Some(handle) = handle {
            self.emit(ControllerEvent::Disconnected {
                address: central,
                handle,
                reason,
                timestamp: monotonic_ms(),
            });
        }
    }

    /// A connected central writes to an attribute of the local GATT server.
    pub fn central_write(
        &self,
        central: BDAddressAndType,
        handle: u16,
        value: impl Into<Vec<u8>>,
        offset: u16,
    ) {
        self.emit(ControllerEvent::ServerWrite {
            address: central,
            handle,
            value: value.into(),
            offset,
            with_response: true,
            timestamp: monotonic_ms(),
        });
    }

    /// A connected central re-negotiates the ATT MTU.
    pub fn central_exchange_mtu(&self, central: BDAddressAndType, mtu: u16) {
        self.emit(ControllerEvent::MtuChanged {
            address: central,
            mtu,
            timestamp: monotonic_ms(),
        });
    }

    /// A connected peer pushes a value notification, honoring its CCCD.
    ///
    /// Returns `false` when notifications are not enabled on the peer's
    /// CCCD for that characteristic.
    pub fn peer_notify(
        &self,
        peer: BDAddressAndType,
        value_handle: u16,
        value: impl Into<Vec<u8>>,
    ) -> bool {
        if !self.cccd_bit_set(peer, value_handle, 0x0001) {
            return false;
        }
        self.emit(ControllerEvent::Notification {
            address: peer,
            value_handle,
            value: value.into(),
            timestamp: monotonic_ms(),
        });
        true
    }

    /// A connected peer pushes a value indication, honoring its CCCD. The
    /// ATT layer confirms it before delivery.
    pub fn peer_indicate(
        &self,
        peer: BDAddressAndType,
        value_handle: u16,
        value: impl Into<Vec<u8>>,
    ) -> bool {
        if !self.cccd_bit_set(peer, value_handle, 0x0002) {
            return false;
        }
        self.emit(ControllerEvent::Indication {
            address: peer,
            value_handle,
            value: value.into(),
            confirmation_sent: true,
            timestamp: monotonic_ms(),
        });
        true
    }

    /// The PHYs of a connection change.
    pub fn update_phy(&self, peer: BDAddressAndType, tx: LePhy, rx: LePhy) {
        self.emit(ControllerEvent::PhyUpdated {
            address: peer,
            tx,
            rx,
            timestamp: monotonic_ms(),
        });
    }

    /// A fatal controller failure.
    pub fn fail_fatally(&self, status: HciStatus) {
        self.emit(ControllerEvent::ControllerError {
            status,
            timestamp: monotonic_ms(),
        });
    }

    fn cccd_bit_set(&self, peer: BDAddressAndType, value_handle: u16, bit: u16) -> bool {
        let state = self.state.lock().unwrap();
        if !state.connections.contains_key(&peer) {
            return false;
        }
        let Some(p) = state.peers.get(&peer) else {
            return false;
        };
        let cccd_handle = p.gatt.iter().find_map(|s| {
            s.characteristics
                .iter()
                .find(|c| c.value_handle == value_handle)
                .and_then(|c| {
                    c.descriptors.iter().find_map(|d| {
                        (d.uuid == crate::btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
                            .then_some(d.handle)
                    })
                })
        });
        let Some(cccd_handle) = cccd_handle else {
            return false;
        };
        let value = state.att_values.get(&(peer, cccd_handle));
        let bits = value
            .map(|v| {
                u16::from_le_bytes([
                    v.first().copied().unwrap_or(0),
                    v.get(1).copied().unwrap_or(0),
                ])
            })
            .unwrap_or(0);
        bits & bit != 0
    }

    fn scan_type(active: bool) -> ScanType {
        if active {
            ScanType::LeActive
        } else {
            ScanType::LePassive
        }
    }
}

impl HciController for MockController {
    fn dev_id(&self) -> u16 {
        self.dev_id
    }

    fn address(&self) -> BDAddressAndType {
        self.address
    }

    fn le_features(&self) -> LeFeatures {
        LeFeatures::LE_ENCRYPTION
            | LeFeatures::CONN_PARAM_REQ
            | LeFeatures::LE_PING
            | LeFeatures::LE_PACKET_LENGTH_EXTENSION
            | LeFeatures::LE_2M_PHY
    }

    fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    fn events(&self) -> Receiver<ControllerEvent> {
        self.rx.clone()
    }

    fn submit(&self, cmd: HciCommand) -> HciStatus {
        self.commands.lock().unwrap().push(cmd.clone());
        debug!(dev_id = self.dev_id, ?cmd, "mock command");
        match cmd {
            HciCommand::Reset => {
                let was_scanning = {
                    let mut state = self.state.lock().unwrap();
                    state.advertising = false;
                    state.connections.clear();
                    state.pending_pairing.clear();
                    state.pairing_in_progress.clear();
                    std::mem::take(&mut state.scanning)
                };
                if was_scanning {
                    self.emit(ControllerEvent::DiscoveringChanged {
                        scan_type: ScanType::LeActive,
                        enabled: false,
                        controller_initiated: true,
                        timestamp: monotonic_ms(),
                    });
                }
                HciStatus::Success
            }
            HciCommand::SetPowered(powered) => {
                let settings = {
                    let mut state = self.state.lock().unwrap();
                    state.powered = powered;
                    state.settings = if powered {
                        AdapterSettings::POWERED
                            | AdapterSettings::LE
                            | AdapterSettings::CONNECTABLE
                            | AdapterSettings::BONDABLE
                            | AdapterSettings::SSP
                    } else {
                        AdapterSettings::LE
                    };
                    state.settings
                };
                self.emit(ControllerEvent::SettingsChanged {
                    settings,
                    timestamp: monotonic_ms(),
                });
                HciStatus::Success
            }
            HciCommand::SetName { name, .. } => {
                *self.name.lock().unwrap() = name;
                HciStatus::Success
            }
            HciCommand::SetScanParams(params) => {
                let mut state = self.state.lock().unwrap();
                if !state.powered {
                    return HciStatus::CommandDisallowed;
                }
                state.scan_active = params.active;
                HciStatus::Success
            }
            HciCommand::SetScanEnable { enabled, .. } => {
                let (changed, active, reports) = {
                    let mut state = self.state.lock().unwrap();
                    if !state.powered {
                        return HciStatus::CommandDisallowed;
                    }
                    let changed = state.scanning != enabled;
                    state.scanning = enabled;
                    let reports: Vec<(BDAddressAndType, Vec<u8>, Vec<u8>)> = if enabled {
                        state
                            .peers
                            .values()
                            .filter(|p| !p.adv_data.is_empty())
                            .map(|p| (p.address, p.adv_data.clone(), p.scan_rsp.clone()))
                            .collect()
                    } else {
                        Vec::new()
                    };
                    (changed, state.scan_active, reports)
                };
                if changed {
                    self.emit(ControllerEvent::DiscoveringChanged {
                        scan_type: Self::scan_type(active),
                        enabled,
                        controller_initiated: false,
                        timestamp: monotonic_ms(),
                    });
                }
                for (address, adv, rsp) in reports {
                    self.emit(ControllerEvent::DeviceFound {
                        address,
                        source: EirSource::AdInd,
                        data: adv,
                        rssi: -55,
                        timestamp: monotonic_ms(),
                    });
                    if active && !rsp.is_empty() {
                        self.emit(ControllerEvent::DeviceFound {
                            address,
                            source: EirSource::AdScanRsp,
                            data: rsp,
                            rssi: -55,
                            timestamp: monotonic_ms(),
                        });
                    }
                }
                HciStatus::Success
            }
            HciCommand::SetAdvertisingParams(_) | HciCommand::SetAdvertisingData { .. } => {
                if !self.state.lock().unwrap().powered {
                    return HciStatus::CommandDisallowed;
                }
                HciStatus::Success
            }
            HciCommand::SetAdvertisingEnable(enabled) => {
                let mut state = self.state.lock().unwrap();
                if !state.powered {
                    return HciStatus::CommandDisallowed;
                }
                state.advertising = enabled;
                HciStatus::Success
            }
            HciCommand::CreateConnection { peer, .. } => {
                let known = {
                    let mut state = self.state.lock().unwrap();
                    if !state.powered {
                        return HciStatus::CommandDisallowed;
                    }
                    if state.connections.contains_key(&peer) {
                        return HciStatus::ConnectionAlreadyExists;
                    }
                    if state.peers.contains_key(&peer) {
                        let handle = state.next_handle;
                        state.next_handle += 1;
                        state.connections.insert(peer, handle);
                        Some(handle)
                    } else {
                        None
                    }
                };
                match known {
                    Some(handle) => {
                        self.emit(ControllerEvent::Connected {
                            address: peer,
                            handle,
                            incoming: false,
                            timestamp: monotonic_ms(),
                        });
                        self.begin_pairing(peer);
                    }
                    None => {
                        self.emit(ControllerEvent::ConnectFailed {
                            address: peer,
                            status: HciStatus::PageTimeout,
                            timestamp: monotonic_ms(),
                        });
                    }
                }
                HciStatus::Success
            }
            HciCommand::Disconnect { peer, reason } => {
                let (handle, pairing) = {
                    let mut state = self.state.lock().unwrap();
                    (
                        state.connections.remove(&peer),
                        state.pairing_in_progress.remove(&peer),
                    )
                };
                let Some(handle) = handle else {
                    return HciStatus::Success;
                };
                if let Some(mode) = pairing {
                    // Disconnect mid-SMP aborts the pairing first.
                    self.state.lock().unwrap().pending_pairing.remove(&peer);
                    self.emit(ControllerEvent::PairingState {
                        address: peer,
                        state: SmpPairingState::Failed,
                        mode,
                        status: HciStatus::OperationCancelledByHost,
                        timestamp: monotonic_ms(),
                    });
                }
                self.emit(ControllerEvent::Disconnected {
                    address: peer,
                    handle,
                    reason,
                    timestamp: monotonic_ms(),
                });
                HciStatus::Success
            }
            HciCommand::WhitelistAdd(_)
            | HciCommand::WhitelistRemove(_)
            | HciCommand::WhitelistClear
            | HciCommand::SetDefaultConnParams(_) => HciStatus::Success,
            HciCommand::UploadLongTermKey { peer, ltk } => {
                self.state
                    .lock()
                    .unwrap()
                    .uploaded_ltks
                    .entry(peer)
                    .or_default()
                    .push(ltk);
                HciStatus::Success
            }
            HciCommand::SetSecurity {
                peer,
                level,
                io_cap,
            } => {
                self.state
                    .lock()
                    .unwrap()
                    .security
                    .insert(peer, (level, io_cap));
                HciStatus::Success
            }
            HciCommand::PasskeyReply { peer, passkey } => {
                let expected = match self.state.lock().unwrap().pending_pairing.remove(&peer) {
                    Some(PendingPairing::Passkey(expected)) => expected,
                    other => {
                        if let Some(other) = other {
                            self.state
                                .lock()
                                .unwrap()
                                .pending_pairing
                                .insert(peer, other);
                        }
                        return HciStatus::CommandDisallowed;
                    }
                };
                match passkey {
                    Some(passkey) if passkey == expected => {
                        self.pairing_success(peer, PairingMode::PasskeyEntryIni);
                    }
                    _ => {
                        self.pairing_failure(
                            peer,
                            PairingMode::PasskeyEntryIni,
                            HciStatus::AuthenticationFailure,
                        );
                    }
                }
                HciStatus::Success
            }
            HciCommand::NumericComparisonReply { peer, accept } => {
                match self.state.lock().unwrap().pending_pairing.remove(&peer) {
                    Some(PendingPairing::NumericComparison) => {}
                    other => {
                        if let Some(other) = other {
                            self.state
                                .lock()
                                .unwrap()
                                .pending_pairing
                                .insert(peer, other);
                        }
                        return HciStatus::CommandDisallowed;
                    }
                }
                if accept {
                    self.pairing_success(peer, PairingMode::NumericCompareIni);
                } else {
                    self.pairing_failure(
                        peer,
                        PairingMode::NumericCompareIni,
                        HciStatus::AuthenticationFailure,
                    );
                }
                HciStatus::Success
            }
        }
    }

    fn att_exchange_mtu(&self, peer: BDAddressAndType, mtu: u16) -> Result<u16> {
        let state = self.state.lock().unwrap();
        if !state.connections.contains_key(&peer) {
            return Err(ErrorKind::NotConnected.into());
        }
        Ok(mtu.min(247))
    }

    fn att_discover(&self, peer: BDAddressAndType) -> Result<Vec<GattServiceDef>> {
        let state = self.state.lock().unwrap();
        if !state.connections.contains_key(&peer) {
            return Err(ErrorKind::NotConnected.into());
        }
        match state.peers.get(&peer) {
            Some(p) => Ok(p.gatt.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn att_read(&self, peer: BDAddressAndType, value_handle: u16) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if !state.connections.contains_key(&peer) {
            return Err(ErrorKind::NotConnected.into());
        }
        match state.att_values.get(&(peer, value_handle)) {
            Some(value) => Ok(value.clone()),
            None => Err(Error::new(
                ErrorKind::InvalidHandle,
                format!("no attribute {value_handle:#06x}"),
            )),
        }
    }

    fn att_write(
        &self,
        peer: BDAddressAndType,
        value_handle: u16,
        value: &[u8],
        _with_response: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.connections.contains_key(&peer) {
            return Err(ErrorKind::NotConnected.into());
        }
        state
            .att_values
            .insert((peer, value_handle), value.to_vec());
        Ok(())
    }
}

/// An [`HciHost`] over a mutable set of [`MockController`]s, with hot-plug
/// injection for tests.
pub struct MockHost {
    controllers: Mutex<Vec<Arc<MockController>>>,
    tx: Sender<HotplugEvent>,
    rx: Receiver<HotplugEvent>,
}

impl MockHost {
    /// Creates an empty host.
    pub fn new() -> Arc<MockHost> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(MockHost {
            controllers: Mutex::new(Vec::new()),
            tx,
            rx,
        })
    }

    /// Adds a controller; emits a hot-plug event to any watching manager.
    pub fn add_controller(&self, controller: Arc<MockController>) {
        self.controllers.lock().unwrap().push(controller.clone());
        let _ = self.tx.send(HotplugEvent::Added(controller));
    }

    /// Removes a controller; emits a hot-plug event to any watching
    /// manager.
    pub fn remove_controller(&self, dev_id: u16) {
        self.controllers
            .lock()
            .unwrap()
            .retain(|c| c.dev_id() != dev_id);
        let _ = self.tx.send(HotplugEvent::Removed(dev_id));
    }
}

impl HciHost for MockHost {
    fn controllers(&self) -> Vec<Arc<dyn HciController>> {
        self.controllers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.clone() as Arc<dyn HciController>)
            .collect()
    }

    fn hotplug_events(&self) -> Receiver<HotplugEvent> {
        self.rx.clone()
    }
}
