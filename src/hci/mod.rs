//! The Host Controller Interface seam the core drives.
//!
//! The kernel transport is out of scope; the stack consumes an
//! [`HciController`]: blocking command submission plus an ordered event
//! stream, with the ATT client data plane as blocking calls on the same
//! trait. [`mock::MockController`] is the in-tree implementation used by the
//! test-suite.
//!
//! Status codes follow the Bluetooth Core Specification, Vol 2, Part D; the
//! stack's own supplementary conditions occupy `0xf0..=0xfe`.

pub mod mock;

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use uuid::Uuid;

use crate::address::BDAddressAndType;
use crate::adapter::AdapterSettings;
use crate::eir::EirSource;
use crate::error::{Error, ErrorKind};
use crate::smp::{
    BtSecurityLevel, KeyDirection, PairingMode, SmpIdentityResolvingKey, SmpIoCapability,
    SmpLinkKey, SmpLongTermKey, SmpPairingState, SmpSignatureResolvingKey,
};
use crate::{Result, ScanType};

/// HCI status codes ([Vol 2] Part D, Section 1.3), re-exposed unchanged, plus
/// this stack's supplementary codes in the reserved `0xf0..=0xfe` range.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum HciStatus {
    #[default]
    Success = 0x00,
    UnknownCommand = 0x01,
    UnknownConnectionIdentifier = 0x02,
    HardwareFailure = 0x03,
    PageTimeout = 0x04,
    AuthenticationFailure = 0x05,
    PinOrKeyMissing = 0x06,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    SynchronousConnectionLimitExceeded = 0x0a,
    ConnectionAlreadyExists = 0x0b,
    CommandDisallowed = 0x0c,
    ConnectionRejectedLimitedResources = 0x0d,
    ConnectionRejectedSecurityReasons = 0x0e,
    ConnectionRejectedUnacceptableBdAddr = 0x0f,
    ConnectionAcceptTimeoutExceeded = 0x10,
    UnsupportedFeatureOrParameterValue = 0x11,
    InvalidHciCommandParameters = 0x12,
    RemoteUserTerminatedConnection = 0x13,
    RemoteDeviceTerminatedConnectionLowResources = 0x14,
    RemoteDeviceTerminatedConnectionPowerOff = 0x15,
    ConnectionTerminatedByLocalHost = 0x16,
    RepeatedAttempts = 0x17,
    PairingNotAllowed = 0x18,
    UnknownLmpPdu = 0x19,
    UnsupportedRemoteFeature = 0x1a,
    ScoOffsetRejected = 0x1b,
    ScoIntervalRejected = 0x1c,
    ScoAirModeRejected = 0x1d,
    InvalidLmpParameters = 0x1e,
    UnspecifiedError = 0x1f,
    UnsupportedLmpParameterValue = 0x20,
    RoleChangeNotAllowed = 0x21,
    LmpResponseTimeout = 0x22,
    LmpErrorTransactionCollision = 0x23,
    LmpPduNotAllowed = 0x24,
    EncryptionModeNotAcceptable = 0x25,
    LinkKeyCannotBeChanged = 0x26,
    RequestedQosNotSupported = 0x27,
    InstantPassed = 0x28,
    PairingWithUnitKeyNotSupported = 0x29,
    DifferentTransactionCollision = 0x2a,
    QosUnacceptableParameter = 0x2c,
    QosRejected = 0x2d,
    ChannelAssessmentNotSupported = 0x2e,
    InsufficientSecurity = 0x2f,
    ParameterOutOfMandatoryRange = 0x30,
    RoleSwitchPending = 0x32,
    ReservedSlotViolation = 0x34,
    RoleSwitchFailed = 0x35,
    ExtendedInquiryResponseTooLarge = 0x36,
    SecureSimplePairingNotSupportedByHost = 0x37,
    HostBusyPairing = 0x38,
    ConnectionRejectedNoSuitableChannel = 0x39,
    ControllerBusy = 0x3a,
    UnacceptableConnectionParam = 0x3b,
    AdvertisingTimeout = 0x3c,
    ConnectionTerminatedMicFailure = 0x3d,
    ConnectionFailedEstablishment = 0x3e,
    MacConnectionFailed = 0x3f,
    CoarseClockAdjustmentRejected = 0x40,
    Type0SubmapNotDefined = 0x41,
    UnknownAdvertisingIdentifier = 0x42,
    LimitReached = 0x43,
    OperationCancelledByHost = 0x44,
    PacketTooLong = 0x45,

    // Supplementary codes of this stack, outside the Core Spec range.
    Failed = 0xf0,
    Timeout = 0xf1,
    Disconnected = 0xf2,
    NotSupported = 0xf3,
    InvalidParams = 0xf4,
    InternalTimeout = 0xfd,
    Unknown = 0xfe,
}

impl HciStatus {
    /// Shorthand for `self == HciStatus::Success`.
    pub fn is_ok(self) -> bool {
        self == HciStatus::Success
    }

    /// Converts a raw status octet, mapping unassigned values to `Unknown`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::UnknownCommand,
            0x02 => Self::UnknownConnectionIdentifier,
            0x03 => Self::HardwareFailure,
            0x04 => Self::PageTimeout,
            0x05 => Self::AuthenticationFailure,
            0x06 => Self::PinOrKeyMissing,
            0x07 => Self::MemoryCapacityExceeded,
            0x08 => Self::ConnectionTimeout,
            0x09 => Self::ConnectionLimitExceeded,
            0x0a => Self::SynchronousConnectionLimitExceeded,
            0x0b => Self::ConnectionAlreadyExists,
            0x0c => Self::CommandDisallowed,
            0x0d => Self::ConnectionRejectedLimitedResources,
            0x0e => Self::ConnectionRejectedSecurityReasons,
            0x0f => Self::ConnectionRejectedUnacceptableBdAddr,
            0x10 => Self::ConnectionAcceptTimeoutExceeded,
            0x11 => Self::UnsupportedFeatureOrParameterValue,
            0x12 => Self::InvalidHciCommandParameters,
            0x13 => Self::RemoteUserTerminatedConnection,
            0x14 => Self::RemoteDeviceTerminatedConnectionLowResources,
            0x15 => Self::RemoteDeviceTerminatedConnectionPowerOff,
            0x16 => Self::ConnectionTerminatedByLocalHost,
            0x17 => Self::RepeatedAttempts,
            0x18 => Self::PairingNotAllowed,
            0x19 => Self::UnknownLmpPdu,
            0x1a => Self::UnsupportedRemoteFeature,
            0x1b => Self::ScoOffsetRejected,
            0x1c => Self::ScoIntervalRejected,
            0x1d => Self::ScoAirModeRejected,
            0x1e => Self::InvalidLmpParameters,
            0x1f => Self::UnspecifiedError,
            0x20 => Self::UnsupportedLmpParameterValue,
            0x21 => Self::RoleChangeNotAllowed,
            0x22 => Self::LmpResponseTimeout,
            0x23 => Self::LmpErrorTransactionCollision,
            0x24 => Self::LmpPduNotAllowed,
            0x25 => Self::EncryptionModeNotAcceptable,
            0x26 => Self::LinkKeyCannotBeChanged,
            0x27 => Self::RequestedQosNotSupported,
            0x28 => Self::InstantPassed,
            0x29 => Self::PairingWithUnitKeyNotSupported,
            0x2a => Self::DifferentTransactionCollision,
            0x2c => Self::QosUnacceptableParameter,
            0x2d => Self::QosRejected,
            0x2e => Self::ChannelAssessmentNotSupported,
            0x2f => Self::InsufficientSecurity,
            0x30 => Self::ParameterOutOfMandatoryRange,
            0x32 => Self::RoleSwitchPending,
            0x34 => Self::ReservedSlotViolation,
            0x35 => Self::RoleSwitchFailed,
            0x36 => Self::ExtendedInquiryResponseTooLarge,
            0x37 => Self::SecureSimplePairingNotSupportedByHost,
            0x38 => Self::HostBusyPairing,
            0x39 => Self::ConnectionRejectedNoSuitableChannel,
            0x3a => Self::ControllerBusy,
            0x3b => Self::UnacceptableConnectionParam,
            0x3c => Self::AdvertisingTimeout,
            0x3d => Self::ConnectionTerminatedMicFailure,
            0x3e => Self::ConnectionFailedEstablishment,
            0x3f => Self::MacConnectionFailed,
            0x40 => Self::CoarseClockAdjustmentRejected,
            0x41 => Self::Type0SubmapNotDefined,
            0x42 => Self::UnknownAdvertisingIdentifier,
            0x43 => Self::LimitReached,
            0x44 => Self::OperationCancelledByHost,
            0x45 => Self::PacketTooLong,
            0xf0 => Self::Failed,
            0xf1 => Self::Timeout,
            0xf2 => Self::Disconnected,
            0xf3 => Self::NotSupported,
            0xf4 => Self::InvalidParams,
            0xfd => Self::InternalTimeout,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for HciStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#04x})", self, *self as u8)
    }
}

impl From<HciStatus> for Error {
    fn from(status: HciStatus) -> Self {
        let kind = match status {
            HciStatus::Success => ErrorKind::Unknown,
            HciStatus::InvalidParams | HciStatus::InvalidHciCommandParameters => {
                ErrorKind::InvalidParameters
            }
            HciStatus::ConnectionAlreadyExists => ErrorKind::AlreadyConnected,
            HciStatus::Disconnected | HciStatus::UnknownConnectionIdentifier => {
                ErrorKind::NotConnected
            }
            HciStatus::Timeout | HciStatus::ConnectionTimeout | HciStatus::InternalTimeout => {
                ErrorKind::Timeout
            }
            HciStatus::NotSupported | HciStatus::UnsupportedFeatureOrParameterValue => {
                ErrorKind::NotSupported
            }
            _ => ErrorKind::Unknown,
        };
        Error::new(kind, status.to_string())
    }
}

/// Computes the conventional supervision timeout in units of 10 ms.
///
/// `max(floor_ms, (1 + latency) × conn_interval_max_ms × max(2, multiplier)) / 10`
pub fn supervision_timeout_with(
    latency: u16,
    conn_interval_max_ms: u16,
    floor_ms: u16,
    multiplier: u16,
) -> u16 {
    let product =
        (1 + latency as u32) * conn_interval_max_ms as u32 * multiplier.max(2) as u32;
    (product.max(floor_ms as u32) / 10) as u16
}

/// [`supervision_timeout_with`] with the conventional 500 ms floor and
/// multiplier 10.
pub fn supervision_timeout(latency: u16, conn_interval_max_ms: u16) -> u16 {
    supervision_timeout_with(latency, conn_interval_max_ms, 500, 10)
}

bitflags::bitflags! {
    /// Optional LE Link Layer features of a controller.
    ///
    /// See the Bluetooth Core Specification, Vol 6, Part B, §4.6.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct LeFeatures: u64 {
        /// LE data encryption.
        const LE_ENCRYPTION = 1 << 0;
        /// Connection parameters request procedure.
        const CONN_PARAM_REQ = 1 << 1;
        /// Extended reject indication.
        const EXTENDED_REJECT_INDICATION = 1 << 2;
        /// Slave-initiated feature exchange.
        const SLAVE_FEATURE_EXCHANGE = 1 << 3;
        /// LE ping procedure.
        const LE_PING = 1 << 4;
        /// Data length extension.
        const LE_PACKET_LENGTH_EXTENSION = 1 << 5;
        /// Link Layer privacy (resolvable private addresses).
        const LL_PRIVACY = 1 << 6;
        /// Extended scan filter policies.
        const EXT_SCANNER_FILTER_POLICIES = 1 << 7;
        /// 2 Msym/s PHY.
        const LE_2M_PHY = 1 << 8;
        /// Coded PHY for long range.
        const LE_CODED_PHY = 1 << 11;
        /// Extended advertising.
        const LE_EXTENDED_ADVERTISING = 1 << 12;
        /// Periodic advertising.
        const LE_PERIODIC_ADVERTISING = 1 << 13;
        /// Channel selection algorithm #2.
        const CHANNEL_SELECTION_ALGORITHM_2 = 1 << 14;
    }
}

/// LE scan parameters in controller units of 0.625 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    /// Time between scan windows; clamped to `[4, 16384]`.
    pub interval: u16,
    /// Duration of one scan window; clamped to `[4, interval]`.
    pub window: u16,
    /// Active scanning issues scan requests for scan-response data.
    pub active: bool,
    /// Controller filter policy octet.
    pub filter_policy: u8,
    /// Drop duplicate advertising reports in the controller.
    pub filter_duplicates: bool,
}

impl Default for ScanParameters {
    fn default() -> Self {
        ScanParameters {
            interval: 24,
            window: 24,
            active: true,
            filter_policy: 0,
            filter_duplicates: false,
        }
    }
}

/// LE advertising parameters in controller units of 0.625 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingParameters {
    /// Minimum advertising interval; clamped to `[0x0020, 0x4000]`.
    pub interval_min: u16,
    /// Maximum advertising interval; clamped to `[interval_min, 0x4000]`.
    pub interval_max: u16,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        AdvertisingParameters {
            interval_min: 0x0100,
            interval_max: 0x0100,
        }
    }
}

/// Parameters for an outgoing LE connection.
///
/// Scan fields use 0.625 ms units, connection intervals 1.25 ms units and the
/// supervision timeout 10 ms units.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub le_scan_interval: u16,
    pub le_scan_window: u16,
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters {
            le_scan_interval: 24,
            le_scan_window: 24,
            conn_interval_min: 12,
            conn_interval_max: 12,
            conn_latency: 0,
            supervision_timeout: supervision_timeout(0, 15),
        }
    }
}

/// Default connection parameters applied to incoming peripheral-side
/// connections. Intervals in 1.25 ms units, timeout in 10 ms units.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultConnectionParams {
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl DefaultConnectionParams {
    /// Validates the Core Spec mandatory ranges: intervals within
    /// `[0x0006, 0x0C80]` and ordered, latency at most `0x01F3`, timeout
    /// within `[0x000A, 0x0C80]`.
    pub fn is_valid(&self) -> bool {
        (0x0006..=0x0c80).contains(&self.min_interval)
            && (0x0006..=0x0c80).contains(&self.max_interval)
            && self.min_interval <= self.max_interval
            && self.latency <= 0x01f3
            && (0x000a..=0x0c80).contains(&self.timeout)
    }
}

impl Default for DefaultConnectionParams {
    fn default() -> Self {
        DefaultConnectionParams {
            min_interval: 12,
            max_interval: 12,
            latency: 0,
            timeout: supervision_timeout(0, 15),
        }
    }
}

/// Discovered remote GATT descriptor, as delivered by the ATT codec layer.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescDef {
    pub handle: u16,
    pub uuid: Uuid,
}

/// Discovered remote GATT characteristic.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharDef {
    pub handle: u16,
    pub value_handle: u16,
    pub uuid: Uuid,
    /// Property bits per Core Spec Vol 3, Part G, §3.3.1.1.
    pub properties: u8,
    pub descriptors: Vec<GattDescDef>,
}

/// Discovered remote GATT service.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceDef {
    pub start_handle: u16,
    pub end_handle: u16,
    pub primary: bool,
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharDef>,
}

/// Commands the core issues to a controller.
///
/// Command submission blocks until the controller acknowledges; the adapter
/// serializes submissions so at most one command per adapter is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum HciCommand {
    /// Full controller reset.
    Reset,
    /// Power the controller up or down.
    SetPowered(bool),
    /// Set local name and short name.
    SetName { name: String, short_name: String },
    /// Configure LE scanning.
    SetScanParams(ScanParameters),
    /// Enable or disable LE scanning.
    SetScanEnable { enabled: bool, filter_duplicates: bool },
    /// Configure LE advertising intervals.
    SetAdvertisingParams(AdvertisingParameters),
    /// Set advertising and scan-response payloads (AD structure TLVs).
    SetAdvertisingData { data: Vec<u8>, scan_rsp: Vec<u8> },
    /// Enable or disable LE advertising.
    SetAdvertisingEnable(bool),
    /// Initiate an LE connection.
    CreateConnection {
        peer: BDAddressAndType,
        params: ConnectionParameters,
    },
    /// Terminate a connection.
    Disconnect {
        peer: BDAddressAndType,
        reason: HciStatus,
    },
    /// Add a peer to the controller whitelist.
    WhitelistAdd(BDAddressAndType),
    /// Remove a peer from the controller whitelist.
    WhitelistRemove(BDAddressAndType),
    /// Clear the controller whitelist.
    WhitelistClear,
    /// Set default parameters for incoming connections.
    SetDefaultConnParams(DefaultConnectionParams),
    /// Upload a long-term key ahead of a connection so the link comes up
    /// encrypted (pre-paired).
    UploadLongTermKey {
        peer: BDAddressAndType,
        ltk: SmpLongTermKey,
    },
    /// Request a security level for the next connection to `peer`.
    SetSecurity {
        peer: BDAddressAndType,
        level: BtSecurityLevel,
        io_cap: SmpIoCapability,
    },
    /// Answer a passkey expectation; `None` is the graceful negative reply.
    PasskeyReply {
        peer: BDAddressAndType,
        passkey: Option<u32>,
    },
    /// Answer a numeric-comparison expectation.
    NumericComparisonReply {
        peer: BDAddressAndType,
        accept: bool,
    },
}

/// Key material distributed for one direction during pairing.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DistributedKeys {
    pub ltk: Option<SmpLongTermKey>,
    pub irk: Option<SmpIdentityResolvingKey>,
    pub csrk: Option<SmpSignatureResolvingKey>,
    pub lk: Option<SmpLinkKey>,
}

/// Events a controller delivers to its adapter, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// The controller settings changed (powered, discoverable, ...).
    SettingsChanged {
        settings: AdapterSettings,
        timestamp: u64,
    },
    /// Scanning started or stopped; `controller_initiated` marks autonomous
    /// pauses (e.g. to establish a connection).
    DiscoveringChanged {
        scan_type: ScanType,
        enabled: bool,
        controller_initiated: bool,
        timestamp: u64,
    },
    /// An advertising report or scan response arrived.
    DeviceFound {
        address: BDAddressAndType,
        source: EirSource,
        /// Raw AD structure TLVs.
        data: Vec<u8>,
        rssi: i8,
        timestamp: u64,
    },
    /// An LE connection is established.
    Connected {
        address: BDAddressAndType,
        handle: u16,
        /// `true` when the remote initiated (we are peripheral).
        incoming: bool,
        timestamp: u64,
    },
    /// An outgoing connection attempt failed.
    ConnectFailed {
        address: BDAddressAndType,
        status: HciStatus,
        timestamp: u64,
    },
    /// A connection is gone.
    Disconnected {
        address: BDAddressAndType,
        handle: u16,
        reason: HciStatus,
        timestamp: u64,
    },
    /// The SMP pairing state machine advanced.
    PairingState {
        address: BDAddressAndType,
        state: SmpPairingState,
        mode: PairingMode,
        status: HciStatus,
        timestamp: u64,
    },
    /// Keys were distributed during pairing.
    KeysDistributed {
        address: BDAddressAndType,
        direction: KeyDirection,
        keys: DistributedKeys,
        timestamp: u64,
    },
    /// The ATT MTU was (re-)negotiated on a connection.
    MtuChanged {
        address: BDAddressAndType,
        mtu: u16,
        timestamp: u64,
    },
    /// The peer sent a characteristic value notification.
    Notification {
        address: BDAddressAndType,
        value_handle: u16,
        value: Vec<u8>,
        timestamp: u64,
    },
    /// The peer sent a characteristic value indication. `confirmation_sent`
    /// reports whether the ATT layer already acknowledged it.
    Indication {
        address: BDAddressAndType,
        value_handle: u16,
        value: Vec<u8>,
        confirmation_sent: bool,
        timestamp: u64,
    },
    /// The PHYs of a connection changed.
    PhyUpdated {
        address: BDAddressAndType,
        tx: crate::LePhy,
        rx: crate::LePhy,
        timestamp: u64,
    },
    /// A connected client wrote to an attribute of the local GATT server.
    ServerWrite {
        address: BDAddressAndType,
        handle: u16,
        value: Vec<u8>,
        offset: u16,
        with_response: bool,
        timestamp: u64,
    },
    /// Fatal controller failure; the adapter becomes invalid.
    ControllerError {
        status: HciStatus,
        timestamp: u64,
    },
}

/// A Bluetooth controller as consumed by one [`Adapter`][crate::Adapter].
///
/// Command submission blocks until the controller acknowledged the command.
/// The `att_*` methods are the blocking ATT client data plane; their wire
/// codec is external to this crate.
pub trait HciController: Send + Sync {
    /// Host-side controller index.
    fn dev_id(&self) -> u16;

    /// The controller's public identity address.
    fn address(&self) -> BDAddressAndType;

    /// The address currently visible on air; differs from
    /// [`address`][Self::address] when privacy is enabled.
    fn visible_address(&self) -> BDAddressAndType {
        self.address()
    }

    /// The controller's supported LE Link Layer features.
    fn le_features(&self) -> LeFeatures;

    /// The controller name.
    fn name(&self) -> String;

    /// Submits one command and blocks for its status.
    fn submit(&self, cmd: HciCommand) -> HciStatus;

    /// The ordered event stream of this controller.
    ///
    /// Every call returns a handle onto the same queue.
    fn events(&self) -> Receiver<ControllerEvent>;

    /// Performs an ATT MTU exchange, returning the negotiated MTU.
    fn att_exchange_mtu(&self, peer: BDAddressAndType, mtu: u16) -> Result<u16>;

    /// Discovers the peer's full service/characteristic/descriptor tree.
    fn att_discover(&self, peer: BDAddressAndType) -> Result<Vec<GattServiceDef>>;

    /// Reads an attribute value.
    fn att_read(&self, peer: BDAddressAndType, value_handle: u16) -> Result<Vec<u8>>;

    /// Writes an attribute value, with or without response.
    fn att_write(
        &self,
        peer: BDAddressAndType,
        value_handle: u16,
        value: &[u8],
        with_response: bool,
    ) -> Result<()>;
}

/// Hot-plug notifications delivered by an [`HciHost`].
#[derive(Clone)]
pub enum HotplugEvent {
    /// A controller appeared.
    Added(Arc<dyn HciController>),
    /// The controller with this `dev_id` disappeared.
    Removed(u16),
}

impl fmt::Debug for HotplugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotplugEvent::Added(c) => write!(f, "Added(dev_id={})", c.dev_id()),
            HotplugEvent::Removed(dev_id) => write!(f, "Removed(dev_id={dev_id})"),
        }
    }
}

/// Enumerates controllers for the [`Manager`][crate::Manager] and reports
/// hot-plug events.
pub trait HciHost: Send + Sync {
    /// The currently present controllers.
    fn controllers(&self) -> Vec<Arc<dyn HciController>>;

    /// The hot-plug event stream; every call returns a handle onto the same
    /// queue.
    fn hotplug_events(&self) -> Receiver<HotplugEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for v in [0x00u8, 0x0b, 0x0c, 0x13, 0x3b, 0x45, 0xf0, 0xf4, 0xfd] {
            assert_eq!(HciStatus::from_u8(v) as u8, v);
        }
        assert_eq!(HciStatus::from_u8(0x90), HciStatus::Unknown);
        assert_eq!(HciStatus::from_u8(0x31), HciStatus::Unknown);
    }

    #[test]
    fn supervision_timeout_convention() {
        // latency 0, 50 ms max interval: floor dominates.
        assert_eq!(supervision_timeout_with(0, 50, 500, 10), 50);
        // larger intervals exceed the floor
        assert_eq!(supervision_timeout_with(0, 100, 500, 10), 100);
        // latency scales the product
        assert_eq!(supervision_timeout_with(4, 50, 500, 10), 250);
        // multiplier is floored at 2
        assert_eq!(supervision_timeout_with(0, 500, 500, 0), 100);
    }

    #[test]
    fn default_conn_params_ranges() {
        assert!(DefaultConnectionParams::default().is_valid());
        let bad = DefaultConnectionParams {
            min_interval: 20,
            max_interval: 10,
            ..Default::default()
        };
        assert!(!bad.is_valid());
        let bad = DefaultConnectionParams {
            timeout: 4,
            ..Default::default()
        };
        assert!(!bad.is_valid());
    }
}
