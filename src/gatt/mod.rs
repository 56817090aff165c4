//! GATT data model: the local server database exposed while advertising and
//! the client-side view of a remote peer's services.

pub mod client;
pub mod server;

pub use client::{GattCharListener, GattCharacteristic, GattDescriptor, GattService};
pub use server::{
    DbGattChar, DbGattDesc, DbGattServer, DbGattServerListener, DbGattService, DEFAULT_MAX_ATT_MTU,
};
