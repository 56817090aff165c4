#![warn(missing_docs)]

//! Bluedirect is a user-space [Bluetooth Low Energy] (BLE) host stack for [Rust] with direct
//! control over Host Controller Interface (HCI) operations, bypassing intermediate daemons.
//!
//! The crate covers the GAP Central and Peripheral roles with the GATT Client and Server data
//! models, the Security Manager pairing state machine with persistable key material, and an
//! event-driven listener framework dispatching on dedicated per-adapter threads. The low-level
//! kernel transport is abstracted behind the [`hci::HciController`] trait; the crate ships
//! [`hci::mock::MockController`] as an in-process controller for tests.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use std::sync::Arc;
//!# use bluedirect::{Manager, BtMode, DiscoveryPolicy, AdapterStatusListener, Device};
//!# use bluedirect::hci::{mock::MockHost, ScanParameters};
//!struct Scanner;
//!
//!impl AdapterStatusListener for Scanner {
//!    fn device_found(&self, device: &Device, _timestamp: u64) -> bool {
//!        println!("found {device}");
//!        device.connect_le();
//!        true // retain the device; we own it until remove()
//!    }
//!
//!    fn device_ready(&self, device: &Device, _timestamp: u64) {
//!        for service in device.gatt_services() {
//!            println!("  service {}", service.uuid);
//!        }
//!        device.remove();
//!    }
//!}
//!
//!# fn main() {
//!let manager = Manager::new(MockHost::new());
//!let adapter = manager.adapters().into_iter().next().expect("no adapter");
//!adapter.initialize(BtMode::Le);
//!adapter.add_status_listener(Arc::new(Scanner));
//!adapter.start_discovery(
//!    DiscoveryPolicy::PauseConnectedUntilReady,
//!    ScanParameters::default(),
//!);
//!# }
//! ```
//!
//! # Overview
//!
//! The primary components are:
//!
//! - [`Manager`] — the entry point: tracks the adapter set of an [`hci::HciHost`], watches
//!   hot-plug events and replays the current set to new [`ChangedAdapterSetListener`]s.
//! - [`Adapter`] — one local controller: power and reset, LE discovery with a
//!   [`DiscoveryPolicy`], LE advertising over a frozen [`gatt::DbGattServer`], whitelist and
//!   default connection parameters, and persistent SMP keys below a configurable directory.
//! - [`Device`] — one remote peer: connection lifecycle, the SMP pairing state machine with
//!   user interaction hooks, per-direction key material, and the cached client-side GATT tree.
//! - [`AdapterStatusListener`] — the event surface. All callbacks of one adapter run strictly
//!   serialized on that adapter's dispatch thread; adapters dispatch in parallel.
//!
//! # Threading
//!
//! Control methods are thread-safe and may be called from any thread, including from within a
//! callback. They block on the controller's command response, so do not call them while holding
//! a lock a callback also takes. [`AdapterStatusListener::device_ready`] is the only callback
//! that may block; every other callback is expected to return promptly. A panic escaping a
//! callback is caught and logged; dispatch threads never die from listener failures.
//!
//! Calling [`Device::remove`] after [`Device::disconnect`] from the same thread is supported
//! (`remove` is idempotent and tolerant of already-disconnected devices); concurrent `remove`
//! calls for the same device from two threads are not.
//!
//! # Error reporting
//!
//! Control-plane methods (connect, discovery, advertising, pairing replies) return an
//! [`hci::HciStatus`]: Core Specification status codes re-exposed unchanged, plus this stack's
//! supplementary codes. Peer-induced failures arrive through the listener callbacks (pairing
//! state `Failed`, disconnect reasons); they never panic and never raise. Data-plane operations
//! (key persistence, GATT reads and writes) return [`Result`].
//!
//! # Feature flags
//!
//! The `serde` feature enables serializing/deserializing the address and identity types.

mod adapter;
pub mod address;
pub mod btuuid;
pub mod bytes;
mod device;
mod dispatch;
pub mod eir;
pub mod error;
pub mod gatt;
pub mod hci;
mod listener;
mod manager;
pub mod smp;
mod util;

pub use adapter::{Adapter, AdapterSettings, WhitelistEntry};
pub use address::{BDAddressAndType, BDAddressType, EUI48Sub, EUI48};
pub use device::Device;
pub use error::Error;
pub use listener::AdapterStatusListener;
pub use manager::{ChangedAdapterSetListener, Manager};
pub use util::monotonic_ms;
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The transports an adapter operates on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BtMode {
    /// Transport not (yet) configured.
    None,
    /// BR/EDR and LE simultaneously.
    Dual,
    /// Classic BR/EDR only.
    Bredr,
    /// Low Energy only.
    #[default]
    Le,
}

/// GAP role of an adapter or of a remote device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BtRole {
    /// Role not (yet) determined.
    #[default]
    None,
    /// Central: initiates connections.
    Master,
    /// Peripheral: advertises and accepts connections.
    Slave,
}

/// The meta scan type of an adapter's discovery session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScanType {
    /// No discovery active.
    #[default]
    None,
    /// LE passive scanning (no scan requests).
    LePassive,
    /// LE active scanning (scan requests for scan-response data).
    LeActive,
    /// BR/EDR inquiry.
    Bredr,
    /// Simultaneous LE and BR/EDR discovery.
    Dual,
}

/// Governs automatic pausing and resuming of discovery around connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DiscoveryPolicy {
    /// Discovery stops on the first connect and is not restarted.
    AutoOff,
    /// Discovery is paused until all connected devices disconnect.
    PauseConnectedUntilDisconnected,
    /// Discovery is paused until all connected devices reach
    /// [`device_ready`][AdapterStatusListener::device_ready].
    #[default]
    PauseConnectedUntilReady,
    /// Discovery is paused until SMP completes, not waiting for GATT
    /// discovery.
    PauseConnectedUntilPaired,
    /// Discovery restarts eagerly whenever the controller pauses it.
    AlwaysOn,
}

/// LE PHYs per the Bluetooth Core Specification, Vol 6, Part A.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LePhy {
    /// 1 Msym/s, the default.
    #[default]
    Le1M,
    /// 2 Msym/s.
    Le2M,
    /// Coded PHY (S=2 or S=8) for long range.
    LeCoded,
}

bitflags::bitflags! {
    /// GATT characteristic properties.
    ///
    /// The low octet carries the declaration's property bits per the
    /// Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1; the extended
    /// properties of §3.3.3.1 follow above them.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperties: u32 {
        /// Broadcast via the Server Characteristic Configuration descriptor.
        const BROADCAST = 1 << 0;
        /// Value may be read.
        const READ = 1 << 1;
        /// Write Without Response.
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        /// Write with response.
        const WRITE = 1 << 3;
        /// Unconfirmed value notifications.
        const NOTIFY = 1 << 4;
        /// Confirmed value indications.
        const INDICATE = 1 << 5;
        /// Authenticated signed writes on an unencrypted link.
        const AUTHENTICATED_SIGNED_WRITES = 1 << 6;
        /// An Extended Properties descriptor is present.
        const EXTENDED_PROPERTIES = 1 << 7;
        /// Queued (reliable) writes, from the extended properties.
        const RELIABLE_WRITE = 1 << 8;
        /// Writable User Description descriptor, from the extended
        /// properties.
        const WRITABLE_AUXILIARIES = 1 << 9;
    }
}

impl CharacteristicProperties {
    /// Lifts the declaration's property octet, without extended bits.
    pub fn from_declaration(octet: u8) -> Self {
        Self::from_bits_truncate(octet as u32)
    }

    /// The declaration's property octet, dropping the extended bits.
    pub fn declaration_octet(self) -> u8 {
        (self.bits() & 0xff) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristic_properties_declaration_octet() {
        let props = CharacteristicProperties::READ
            | CharacteristicProperties::NOTIFY
            | CharacteristicProperties::RELIABLE_WRITE;
        assert_eq!(props.bits(), (1 << 1) | (1 << 4) | (1 << 8));
        // The declaration octet drops the extended bits.
        assert_eq!(props.declaration_octet(), 0x12);
        assert_eq!(
            CharacteristicProperties::from_declaration(0x12),
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY
        );
    }
}
