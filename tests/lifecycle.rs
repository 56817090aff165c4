//! End-to-end lifecycle tests over the mock controller: discovery and its
//! pausing policies, connect/pair/ready ordering, pre-paired reconnects, and
//! the listener registries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bluedirect::address::{BDAddressAndType, BDAddressType};
use bluedirect::eir::{EInfoReport, EirDataType, EirSource, GapFlags};
use bluedirect::gatt::{DbGattChar, DbGattDesc, DbGattServer, DbGattServerListener, DbGattService};
use bluedirect::hci::mock::{MockController, MockHost, MockPeer, PairingScript};
use bluedirect::hci::{
    AdvertisingParameters, GattCharDef, GattDescDef, GattServiceDef, HciStatus, ScanParameters,
};
use bluedirect::smp::{BtSecurityLevel, KeyDirection, PairingMode, SmpIoCapability, SmpKeyBin,
    SmpPairingState};
use bluedirect::{
    btuuid, Adapter, AdapterSettings, AdapterStatusListener, BtMode, ChangedAdapterSetListener,
    CharacteristicProperties, Device, DiscoveryPolicy, Manager,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn addr(s: &str, address_type: BDAddressType) -> BDAddressAndType {
    BDAddressAndType::new(s.parse().unwrap(), address_type)
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

const WAIT: Duration = Duration::from_secs(2);

/// Advertising payload of a scripted peer.
fn adv_payload(name: &str) -> Vec<u8> {
    let mut eir = EInfoReport::new(EirSource::Na, 0);
    eir.set_flags(GapFlags::LE_GEN_DISC | GapFlags::BREDR_UNSUP);
    eir.set_name(name);
    let mut buf = [0u8; 31];
    let mut writer = bluedirect::bytes::ByteWriter::new(&mut buf);
    eir.to_bytes(&mut writer, EirDataType::all()).unwrap();
    let len = writer.bytes_written();
    buf[..len].to_vec()
}

/// A battery service tree as ATT discovery would report it:
/// service 0x10, characteristic decl 0x11 / value 0x12, CCCD 0x13.
fn battery_gatt() -> (Vec<GattServiceDef>, HashMap<u16, Vec<u8>>) {
    let defs = vec![GattServiceDef {
        start_handle: 0x10,
        end_handle: 0x13,
        primary: true,
        uuid: btuuid::services::BATTERY,
        characteristics: vec![GattCharDef {
            handle: 0x11,
            value_handle: 0x12,
            uuid: btuuid::characteristics::BATTERY_LEVEL,
            properties: 0x12, // read | notify
            descriptors: vec![GattDescDef {
                handle: 0x13,
                uuid: btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION,
            }],
        }],
    }];
    let mut values = HashMap::new();
    values.insert(0x12, vec![88u8]);
    (defs, values)
}

fn powered_adapter(dev_id: u16, local: &str) -> (Arc<MockController>, Adapter) {
    let controller = MockController::new(dev_id, addr(local, BDAddressType::LePublic));
    let adapter = Adapter::new(controller.clone());
    assert_eq!(adapter.initialize(BtMode::Le), HciStatus::Success);
    assert!(wait_until(WAIT, || adapter.is_powered()));
    (controller, adapter)
}

/// Records every callback in order and optionally retains found devices,
/// auto-connects them, and gates `device_ready`.
struct Recorder {
    events: Mutex<Vec<String>>,
    retain: bool,
    auto_connect: bool,
    ready_gate: (Mutex<bool>, Condvar),
}

impl Recorder {
    fn new(retain: bool, auto_connect: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
            retain,
            auto_connect,
            ready_gate: (Mutex::new(true), Condvar::new()),
        })
    }

    fn hold_ready(&self) {
        *self.ready_gate.0.lock().unwrap() = false;
    }

    fn release_ready(&self) {
        *self.ready_gate.0.lock().unwrap() = true;
        self.ready_gate.1.notify_all();
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn has(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.starts_with(needle))
    }

    fn count(&self, needle: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(needle))
            .count()
    }
}

impl AdapterStatusListener for Recorder {
    fn adapter_settings_changed(
        &self,
        _adapter: &Adapter,
        old: AdapterSettings,
        changed: AdapterSettings,
        new: AdapterSettings,
        _timestamp: u64,
    ) {
        self.push(format!(
            "settings old={:#x} changed={:#x} new={:#x}",
            old.bits(),
            changed.bits(),
            new.bits()
        ));
    }

    fn discovering_changed(
        &self,
        _adapter: &Adapter,
        _current: bluedirect::ScanType,
        _changed: bluedirect::ScanType,
        enabled: bool,
        _policy: DiscoveryPolicy,
        _timestamp: u64,
    ) {
        self.push(format!("discovering {enabled}"));
    }

    fn device_found(&self, device: &Device, _timestamp: u64) -> bool {
        self.push(format!("found {}", device.address_and_type()));
        if self.auto_connect {
            device.connect_le();
        }
        self.retain
    }

    fn device_connected(&self, device: &Device, _discovered: bool, _timestamp: u64) {
        self.push(format!("connected {}", device.address_and_type()));
    }

    fn device_pairing_state(
        &self,
        _device: &Device,
        state: SmpPairingState,
        mode: PairingMode,
        _timestamp: u64,
    ) {
        self.push(format!("pairing {state:?} {mode:?}"));
    }

    fn device_ready(&self, _device: &Device, _timestamp: u64) {
        let (lock, cvar) = &self.ready_gate;
        let mut allowed = lock.lock().unwrap();
        while !*allowed {
            allowed = cvar.wait(allowed).unwrap();
        }
        self.push("ready");
    }

    fn device_disconnected(
        &self,
        device: &Device,
        reason: HciStatus,
        _handle: u16,
        _timestamp: u64,
    ) {
        self.push(format!("disconnected {} {reason}", device.address_and_type()));
    }
}

#[test]
fn initial_adapter_replay() {
    init_tracing();
    let host = MockHost::new();
    host.add_controller(MockController::new(
        0,
        addr("C0:00:00:00:00:01", BDAddressType::LePublic),
    ));
    host.add_controller(MockController::new(
        1,
        addr("C0:00:00:00:00:02", BDAddressType::LePublic),
    ));

    struct SetRecorder(Mutex<Vec<String>>);
    impl ChangedAdapterSetListener for SetRecorder {
        fn adapter_added(&self, adapter: &Adapter) {
            self.0.lock().unwrap().push(format!("added {}", adapter.dev_id()));
        }
        fn adapter_removed(&self, adapter: &Adapter) {
            self.0
                .lock()
                .unwrap()
                .push(format!("removed {}", adapter.dev_id()));
        }
    }

    let manager = Manager::new(host.clone());
    assert_eq!(manager.adapters().len(), 2);

    let listener = Arc::new(SetRecorder(Mutex::new(Vec::new())));
    assert!(manager.add_changed_adapter_set_listener(listener.clone()));
    // The current set is replayed before add returns.
    assert_eq!(
        listener.0.lock().unwrap().clone(),
        vec!["added 0", "added 1"]
    );
    assert!(!manager.add_changed_adapter_set_listener(listener.clone()));

    host.add_controller(MockController::new(
        2,
        addr("C0:00:00:00:00:03", BDAddressType::LePublic),
    ));
    assert!(wait_until(WAIT, || listener.0.lock().unwrap().len() == 3));
    assert_eq!(manager.adapters().len(), 3);

    let removed = manager.adapter(1).unwrap();
    host.remove_controller(1);
    assert!(wait_until(WAIT, || listener
        .0
        .lock()
        .unwrap()
        .contains(&"removed 1".to_string())));
    assert!(!removed.is_valid());
    assert!(manager.adapter(1).is_none());

    manager.close();
}

#[test]
fn initial_synthetic_settings_event() {
    init_tracing();
    let (_controller, adapter) = powered_adapter(0, "C0:11:00:00:00:01");
    let recorder = Recorder::new(false, false);
    assert!(adapter.add_status_listener(recorder.clone()));
    assert!(!adapter.add_status_listener(recorder.clone()));
    assert_eq!(adapter.status_listener_count(), 1);

    // old and changed masks empty, new mask populated
    assert!(wait_until(WAIT, || recorder.has("settings old=0x0 changed=0x0")));
    adapter.close();
}

#[test]
fn device_found_ownership() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:02");
    let peer = addr("D0:00:00:00:00:01", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("orphan"),
        ..MockPeer::new(peer)
    });

    // Nobody claims the device: it is discarded.
    let dropper = Recorder::new(false, false);
    adapter.add_status_listener(dropper.clone());
    assert_eq!(
        adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default()),
        HciStatus::Success
    );
    assert!(wait_until(WAIT, || dropper.has("found")));
    assert!(wait_until(WAIT, || adapter.discovered_devices().is_empty()));

    // A claiming listener retains it.
    let dropper: Arc<dyn AdapterStatusListener> = dropper;
    adapter.remove_status_listener(&dropper);
    let keeper = Recorder::new(true, false);
    adapter.add_status_listener(keeper.clone());
    assert_eq!(
        adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default()),
        HciStatus::Success
    );
    assert!(wait_until(WAIT, || !adapter.discovered_devices().is_empty()));
    let device = adapter.find_device(&peer).unwrap();
    assert_eq!(device.name(), "orphan");
    assert!(device.eir().flags().unwrap().contains(GapFlags::LE_GEN_DISC));
    adapter.close();
}

#[test]
fn discovery_policy_pause_until_ready() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:03");
    let peer = addr("D0:00:00:00:00:02", BDAddressType::LeRandom);
    let (gatt, values) = battery_gatt();
    controller.add_peer(MockPeer {
        adv_data: adv_payload("sensor"),
        gatt,
        values,
        pairing: PairingScript::JustWorks,
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, false);
    recorder.hold_ready();
    adapter.add_status_listener(recorder.clone());
    assert_eq!(
        adapter.start_discovery(
            DiscoveryPolicy::PauseConnectedUntilReady,
            ScanParameters::default()
        ),
        HciStatus::Success
    );
    assert!(adapter.is_discovering());
    assert!(wait_until(WAIT, || recorder.has("found")));

    let device = adapter.find_device(&peer).unwrap();
    assert_eq!(
        device.set_connection_security(BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput),
        HciStatus::Success
    );
    assert_eq!(device.connect_le(), HciStatus::Success);

    assert!(wait_until(WAIT, || recorder.has("connected")));
    // Discovery stays paused between deviceConnected and deviceReady.
    assert!(!adapter.is_discovering());

    recorder.release_ready();
    assert!(wait_until(WAIT, || recorder.has("ready")));
    assert!(wait_until(WAIT, || adapter.is_discovering()));

    // deviceConnected precedes every devicePairingState, which precede
    // deviceReady.
    let events = recorder.events();
    let connected = events.iter().position(|e| e.starts_with("connected")).unwrap();
    let first_pairing = events.iter().position(|e| e.starts_with("pairing")).unwrap();
    let completed = events
        .iter()
        .position(|e| e.starts_with("pairing Completed"))
        .unwrap();
    let ready = events.iter().position(|e| e == "ready").unwrap();
    assert!(connected < first_pairing);
    assert!(first_pairing <= completed);
    assert!(completed < ready);

    assert_eq!(device.sec_level(), BtSecurityLevel::EncOnly);
    assert_eq!(device.pairing_mode(), PairingMode::JustWorks);
    assert!(device
        .available_keys(KeyDirection::Responder)
        .contains(bluedirect::smp::SmpKeyMask::ENC_KEY));
    adapter.close();
}

#[test]
fn gatt_session_and_notifications() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:04");
    let peer = addr("D0:00:00:00:00:03", BDAddressType::LeRandom);
    let (gatt, values) = battery_gatt();
    controller.add_peer(MockPeer {
        adv_data: adv_payload(""),
        gatt,
        values,
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, true);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("ready")));

    let device = adapter.find_device(&peer).unwrap();
    let services = device.gatt_services();
    assert_eq!(services.len(), 1);
    let battery = device
        .find_gatt_char(
            btuuid::services::BATTERY,
            btuuid::characteristics::BATTERY_LEVEL,
        )
        .unwrap();
    assert!(battery.properties.contains(CharacteristicProperties::NOTIFY));
    assert_eq!(battery.read_value().unwrap(), vec![88]);

    // Without a CCCD write the peer does not notify.
    assert!(!controller.peer_notify(peer, 0x12, vec![70]));

    struct ValueRecorder(Mutex<Vec<(Vec<u8>, bool)>>);
    impl bluedirect::gatt::GattCharListener for ValueRecorder {
        fn notification_received(
            &self,
            _characteristic: &bluedirect::gatt::GattCharacteristic,
            value: &[u8],
            _timestamp: u64,
        ) {
            self.0.lock().unwrap().push((value.to_vec(), false));
        }
        fn indication_received(
            &self,
            _characteristic: &bluedirect::gatt::GattCharacteristic,
            value: &[u8],
            _timestamp: u64,
            confirmation_sent: bool,
        ) {
            self.0.lock().unwrap().push((value.to_vec(), confirmation_sent));
        }
    }
    let values_seen = Arc::new(ValueRecorder(Mutex::new(Vec::new())));
    assert!(battery.add_listener(values_seen.clone()).unwrap());
    assert!(!battery.add_listener(values_seen.clone()).unwrap());
    assert_eq!(device.char_listener_count(), 1);

    let mut state = [false, false];
    assert!(battery
        .config_notification_indication(true, false, &mut state)
        .unwrap());
    assert_eq!(state, [true, false]);

    assert!(controller.peer_notify(peer, 0x12, vec![69]));
    assert!(wait_until(WAIT, || !values_seen.0.lock().unwrap().is_empty()));
    assert_eq!(values_seen.0.lock().unwrap()[0], (vec![69], false));

    let values_seen: Arc<dyn bluedirect::gatt::GattCharListener> = values_seen;
    assert!(battery.remove_listener(&values_seen).unwrap());
    assert_eq!(device.char_listener_count(), 0);
    adapter.close();
}

#[test]
fn pairing_passkey_flow() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:05");
    let peer = addr("D0:00:00:00:00:04", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("lock"),
        pairing: PairingScript::Passkey(117799),
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, false);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("found")));

    let device = adapter.find_device(&peer).unwrap();
    // Replies outside the expectation state are rejected.
    assert_eq!(device.set_pairing_passkey(117799), HciStatus::CommandDisallowed);
    assert_eq!(
        device.set_pairing_numeric_comparison(true),
        HciStatus::CommandDisallowed
    );

    device.set_connection_security(BtSecurityLevel::EncAuth, SmpIoCapability::KeyboardOnly);
    assert_eq!(device.connect_le(), HciStatus::Success);
    assert!(wait_until(WAIT, || device.pairing_state()
        == SmpPairingState::PasskeyExpected));

    assert_eq!(device.set_pairing_passkey(117799), HciStatus::Success);
    assert!(wait_until(WAIT, || device.pairing_state()
        == SmpPairingState::Completed));
    assert!(wait_until(WAIT, || recorder.has("ready")));
    assert_eq!(device.pairing_mode(), PairingMode::PasskeyEntryIni);
    adapter.close();
}

#[test]
fn pairing_passkey_negative_is_graceful_reject() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:06");
    let peer = addr("D0:00:00:00:00:05", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("lock"),
        pairing: PairingScript::Passkey(42),
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, false);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("found")));

    let device = adapter.find_device(&peer).unwrap();
    device.set_connection_security(BtSecurityLevel::EncAuth, SmpIoCapability::KeyboardOnly);
    device.connect_le();
    assert!(wait_until(WAIT, || device.pairing_state()
        == SmpPairingState::PasskeyExpected));
    assert_eq!(device.set_pairing_passkey_negative(), HciStatus::Success);
    assert!(wait_until(WAIT, || recorder.has("pairing Failed")));
    assert!(!recorder.has("ready"));
    adapter.close();
}

#[test]
fn auto_security_descends_silently() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:07");
    let peer = addr("D0:00:00:00:00:06", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("legacy"),
        pairing: PairingScript::JustWorks,
        max_sec_level: BtSecurityLevel::EncOnly,
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, false);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("found")));

    let device = adapter.find_device(&peer).unwrap();
    assert_eq!(
        device.set_connection_security_auto(SmpIoCapability::DisplayYesNo),
        HciStatus::Success
    );
    assert_eq!(device.connect_le(), HciStatus::Success);
    assert!(wait_until(WAIT, || recorder.has("ready")));

    // EncAuthFips and EncAuth fail against this peer; the descent settles at
    // EncOnly without surfacing the intermediate attempts.
    assert_eq!(device.sec_level(), BtSecurityLevel::EncOnly);
    assert_eq!(recorder.count("connected"), 1);
    assert_eq!(recorder.count("disconnected"), 0);
    assert!(!recorder.has("pairing Failed"));
    assert!(recorder.has("pairing Completed"));
    adapter.close();
}

#[test]
fn pre_paired_reconnect_skips_smp() {
    init_tracing();
    let keydir = tempfile::tempdir().unwrap();
    let peer = addr("D0:00:00:00:00:07", BDAddressType::LeRandom);

    // First run: bond and persist the keys.
    {
        let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:08");
        controller.add_peer(MockPeer {
            adv_data: adv_payload("bonded"),
            pairing: PairingScript::JustWorks,
            ..MockPeer::new(peer)
        });
        let recorder = Recorder::new(true, false);
        adapter.add_status_listener(recorder.clone());
        adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
        assert!(wait_until(WAIT, || recorder.has("found")));
        let device = adapter.find_device(&peer).unwrap();
        device.set_connection_security(BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput);
        device.connect_le();
        assert!(wait_until(WAIT, || recorder.has("pairing Completed")));

        let keybin = SmpKeyBin::create(&device);
        assert!(keybin.is_valid());
        keybin.write(keybin.file_path(keydir.path()), true).unwrap();
        adapter.close();
    }

    // Second run: fresh adapter, keys load on initialize, link comes up
    // pre-paired without any SMP exchange.
    let controller = MockController::new(1, addr("C0:11:00:00:00:08", BDAddressType::LePublic));
    controller.add_peer(MockPeer {
        adv_data: adv_payload("bonded"),
        pairing: PairingScript::Passkey(999999), // would require interaction
        ..MockPeer::new(peer)
    });
    let adapter = Adapter::new(controller.clone());
    adapter.set_smp_key_path(keydir.path());
    assert_eq!(adapter.initialize(BtMode::Le), HciStatus::Success);
    assert!(wait_until(WAIT, || adapter.is_powered()));

    let recorder = Recorder::new(true, false);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("found")));
    let device = adapter.find_device(&peer).unwrap();
    assert_eq!(device.connect_le(), HciStatus::Success);

    assert!(wait_until(WAIT, || recorder.has("pairing Completed PrePaired")));
    assert!(wait_until(WAIT, || recorder.has("ready")));
    assert!(!recorder.has("pairing PasskeyExpected"));
    assert!(!recorder.has("pairing FeatureExchange"));
    assert_eq!(device.pairing_mode(), PairingMode::PrePaired);

    let events = recorder.events();
    let connected = events.iter().position(|e| e.starts_with("connected")).unwrap();
    let completed = events
        .iter()
        .position(|e| e.starts_with("pairing Completed"))
        .unwrap();
    assert!(connected < completed);
    adapter.close();
}

#[test]
fn remove_after_disconnect_is_idempotent() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:09");
    let peer = addr("D0:00:00:00:00:08", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("fleeting"),
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, true);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("ready")));

    let device = adapter.find_device(&peer).unwrap();
    assert_eq!(device.disconnect(), HciStatus::Success);
    assert!(wait_until(WAIT, || !device.is_connected()));
    assert!(wait_until(WAIT, || recorder.has("disconnected")));

    assert_eq!(device.remove(), HciStatus::Success);
    assert!(!device.is_valid());
    assert!(adapter.find_device(&peer).is_none());
    assert!(adapter.discovered_devices().is_empty());

    // A second remove finds nothing and still succeeds.
    assert_eq!(device.remove(), HciStatus::Success);

    // Reconnecting a removed device is rejected.
    assert_eq!(device.connect_le(), HciStatus::InvalidParams);
    adapter.close();
}

#[test]
fn disconnect_aborts_pairing_in_progress() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:0A");
    let peer = addr("D0:00:00:00:00:09", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("lock"),
        pairing: PairingScript::Passkey(1234),
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, false);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("found")));
    let device = adapter.find_device(&peer).unwrap();
    device.set_connection_security(BtSecurityLevel::EncAuth, SmpIoCapability::KeyboardOnly);
    device.connect_le();
    assert!(wait_until(WAIT, || device.pairing_state()
        == SmpPairingState::PasskeyExpected));

    assert_eq!(device.disconnect(), HciStatus::Success);
    assert!(wait_until(WAIT, || recorder.has("disconnected")));

    let events = recorder.events();
    let failed = events
        .iter()
        .position(|e| e.starts_with("pairing Failed"))
        .expect("pairing Failed before disconnect");
    let disconnected = events
        .iter()
        .position(|e| e.starts_with("disconnected"))
        .unwrap();
    assert!(failed < disconnected);
    adapter.close();
}

#[test]
fn role_transitions_reject_opposite_operation() {
    init_tracing();
    let (_controller, adapter) = powered_adapter(0, "C0:11:00:00:00:0B");

    assert_eq!(
        adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default()),
        HciStatus::Success
    );
    assert_eq!(adapter.role(), bluedirect::BtRole::Master);
    assert_eq!(
        adapter.start_advertising(
            DbGattServer::new(),
            EInfoReport::default(),
            EirDataType::all(),
            EirDataType::all(),
            AdvertisingParameters::default(),
        ),
        HciStatus::CommandDisallowed
    );

    assert_eq!(adapter.stop_discovery(), HciStatus::Success);
    assert_eq!(adapter.stop_discovery(), HciStatus::Success);
    assert!(wait_until(WAIT, || !adapter.is_discovering()));

    assert_eq!(
        adapter.start_advertising(
            DbGattServer::new(),
            EInfoReport::default(),
            EirDataType::all(),
            EirDataType::all(),
            AdvertisingParameters::default(),
        ),
        HciStatus::Success
    );
    assert_eq!(adapter.role(), bluedirect::BtRole::Slave);
    assert!(adapter.is_advertising());
    assert_eq!(
        adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default()),
        HciStatus::CommandDisallowed
    );
    assert_eq!(adapter.stop_advertising(), HciStatus::Success);
    assert_eq!(adapter.stop_advertising(), HciStatus::Success);
    adapter.close();
}

#[test]
fn advertising_serves_gatt_and_cccd_changes() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:0C");

    let mut db = DbGattServer::new();
    db.add_service(DbGattService::new(
        true,
        btuuid::services::BATTERY,
        vec![DbGattChar::new(
            btuuid::characteristics::BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            vec![DbGattDesc::cccd()],
            vec![100u8],
            false,
        )],
    ));

    struct ServerRecorder {
        events: Mutex<Vec<String>>,
        veto_writes: AtomicBool,
    }
    impl DbGattServerListener for ServerRecorder {
        fn connected(&self, device: &Device, initial_mtu: u16) {
            self.events
                .lock()
                .unwrap()
                .push(format!("connected {} {initial_mtu}", device.address_and_type()));
        }
        fn disconnected(&self, _device: &Device) {
            self.events.lock().unwrap().push("disconnected".into());
        }
        fn mtu_changed(&self, _device: &Device, mtu: u16) {
            self.events.lock().unwrap().push(format!("mtu {mtu}"));
        }
        fn write_char_value(
            &self,
            _device: &Device,
            _service: &DbGattService,
            _characteristic: &DbGattChar,
            _value: &[u8],
            _offset: u16,
        ) -> bool {
            !self.veto_writes.load(Ordering::Relaxed)
        }
        fn write_char_value_done(
            &self,
            _device: &Device,
            _service: &DbGattService,
            characteristic: &DbGattChar,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("write done {}", characteristic.uuid));
        }
        fn client_char_config_changed(
            &self,
            _device: &Device,
            _service: &DbGattService,
            _characteristic: &DbGattChar,
            _descriptor: &DbGattDesc,
            notify: bool,
            indicate: bool,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("cccd {notify} {indicate}"));
        }
    }
    let server_recorder = Arc::new(ServerRecorder {
        events: Mutex::new(Vec::new()),
        veto_writes: AtomicBool::new(false),
    });
    db.add_listener(server_recorder.clone());

    assert_eq!(
        adapter.start_advertising(
            db,
            EInfoReport::default(),
            EirDataType::all(),
            EirDataType::all(),
            AdvertisingParameters::default(),
        ),
        HciStatus::Success
    );
    let db = adapter.gatt_server().unwrap();
    assert!(db.handles_assigned());
    let level = db
        .find_char(
            btuuid::services::BATTERY,
            btuuid::characteristics::BATTERY_LEVEL,
        )
        .unwrap();
    let value_handle = level.value_handle();
    let cccd_handle = level.client_char_config().unwrap().handle();

    let central = addr("E0:00:00:00:00:01", BDAddressType::LeRandom);
    controller.central_connect(central);
    assert!(wait_until(WAIT, || server_recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.starts_with("connected"))));
    assert!(!adapter.is_advertising());

    controller.central_exchange_mtu(central, 185);
    assert!(wait_until(WAIT, || server_recorder
        .events
        .lock()
        .unwrap()
        .contains(&"mtu 185".to_string())));

    // CCCD write enables notifications and fires the config callback.
    controller.central_write(central, cccd_handle, vec![1, 0], 0);
    assert!(wait_until(WAIT, || server_recorder
        .events
        .lock()
        .unwrap()
        .contains(&"cccd true false".to_string())));

    // Accepted value write mutates the attribute and reports completion.
    controller.central_write(central, value_handle, vec![55], 0);
    assert!(wait_until(WAIT, || level.value() == vec![55]));

    // Vetoed writes change nothing.
    server_recorder.veto_writes.store(true, Ordering::Relaxed);
    controller.central_write(central, value_handle, vec![11], 0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(level.value(), vec![55]);

    assert!(db.reset_client_char_config(
        btuuid::services::BATTERY,
        btuuid::characteristics::BATTERY_LEVEL
    ));
    assert_eq!(level.client_char_config().unwrap().value(), vec![0, 0]);

    controller.central_disconnect(central, HciStatus::RemoteUserTerminatedConnection);
    assert!(wait_until(WAIT, || server_recorder
        .events
        .lock()
        .unwrap()
        .contains(&"disconnected".to_string())));
    adapter.close();
}

#[test]
fn whitelist_and_conn_params_guards() {
    init_tracing();
    let controller = MockController::new(0, addr("C0:11:00:00:00:0D", BDAddressType::LePublic));
    let adapter = Adapter::new(controller);

    // Default connection parameters are only writable while powered off.
    assert_eq!(
        adapter.set_default_conn_params(Default::default()),
        HciStatus::Success
    );
    let bad = bluedirect::hci::DefaultConnectionParams {
        min_interval: 2,
        ..Default::default()
    };
    assert_eq!(adapter.set_default_conn_params(bad), HciStatus::InvalidParams);

    assert_eq!(adapter.initialize(BtMode::Le), HciStatus::Success);
    assert!(wait_until(WAIT, || adapter.is_powered()));
    assert_eq!(
        adapter.set_default_conn_params(Default::default()),
        HciStatus::CommandDisallowed
    );

    let entry = bluedirect::WhitelistEntry {
        address: addr("D0:00:00:00:00:0A", BDAddressType::LeRandom),
        conn_interval_min: 12,
        conn_interval_max: 12,
        conn_latency: 0,
        supervision_timeout: 50,
    };
    assert!(adapter.add_device_to_whitelist(entry));
    assert!(!adapter.add_device_to_whitelist(entry));
    assert_eq!(adapter.whitelist().len(), 1);
    assert!(adapter.remove_device_from_whitelist(&entry.address));
    assert!(!adapter.remove_device_from_whitelist(&entry.address));
    adapter.close();
}

#[test]
fn bredr_peer_is_peer_type_dispatched() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:0E");
    let peer = addr("D0:00:00:00:00:0B", BDAddressType::Bredr);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("classic"),
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, false);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || recorder.has("found")));

    let device = adapter.find_device(&peer).unwrap();
    assert_eq!(device.connect(), HciStatus::NotSupported);
    adapter.close();
}

#[test]
fn device_scoped_status_listener_filters_peers() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:10");
    let peer_a = addr("D0:00:00:00:00:0D", BDAddressType::LeRandom);
    let peer_b = addr("D0:00:00:00:00:0E", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("alpha"),
        ..MockPeer::new(peer_a)
    });
    controller.add_peer(MockPeer {
        adv_data: adv_payload("beta"),
        ..MockPeer::new(peer_b)
    });

    let keeper = Recorder::new(true, false);
    adapter.add_status_listener(keeper.clone());
    adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, Default::default());
    assert!(wait_until(WAIT, || adapter.discovered_devices().len() == 2));

    let device_a = adapter.find_device(&peer_a).unwrap();
    let scoped = Recorder::new(true, false);
    assert!(device_a.add_status_listener(scoped.clone()));
    assert!(!device_a.add_status_listener(scoped.clone()));
    assert_eq!(device_a.status_listener_count(), 1);

    // Connect both; the scoped listener only sees peer A.
    adapter.find_device(&peer_b).unwrap().connect_le();
    device_a.connect_le();
    assert!(wait_until(WAIT, || keeper.count("connected") == 2));
    assert!(wait_until(WAIT, || scoped.count("connected") == 1));
    assert!(scoped.has(&format!("connected {peer_a}")));
    assert!(!scoped.has(&format!("connected {peer_b}")));

    let scoped_dyn: Arc<dyn AdapterStatusListener> = scoped;
    assert!(device_a.remove_status_listener(&scoped_dyn));
    assert!(!device_a.remove_status_listener(&scoped_dyn));
    adapter.close();
}

#[test]
fn adapter_reports_le_features() {
    init_tracing();
    let (_controller, adapter) = powered_adapter(0, "C0:11:00:00:00:11");
    let features = adapter.le_features();
    assert!(features.contains(bluedirect::hci::LeFeatures::LE_ENCRYPTION));
    assert_eq!(adapter.visible_address_and_type(), adapter.address_and_type());
    adapter.close();
}

#[test]
fn always_on_policy_restarts_discovery() {
    init_tracing();
    let (controller, adapter) = powered_adapter(0, "C0:11:00:00:00:0F");
    let peer = addr("D0:00:00:00:00:0C", BDAddressType::LeRandom);
    controller.add_peer(MockPeer {
        adv_data: adv_payload("beacon"),
        ..MockPeer::new(peer)
    });

    let recorder = Recorder::new(true, true);
    adapter.add_status_listener(recorder.clone());
    adapter.start_discovery(DiscoveryPolicy::AlwaysOn, Default::default());
    assert!(wait_until(WAIT, || recorder.has("ready")));
    // Connecting paused the scan; AlwaysOn brings it right back.
    assert!(wait_until(WAIT, || adapter.is_discovering()));
    adapter.close();
}
