//! Short Bluetooth UUID handling and the GATT assigned numbers this stack
//! relies on.
//!
//! The SIG assigns 16-bit aliases inside the Bluetooth Base UUID range; the
//! helpers here expand and shrink between the alias and the full [`Uuid`].
//! See the [assigned numbers] document.
//!
//! [assigned numbers]: https://www.bluetooth.com/specifications/assigned-numbers/

use uuid::Uuid;

/// Value of the Bluetooth Base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
const BASE: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Bits of a full UUID that must match the base for a short alias to exist.
const BASE_MASK: u128 = (1 << 96) - 1;

/// The Bluetooth Base UUID every SIG-assigned short UUID aliases into.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE);

/// Expands a SIG-assigned 16-bit UUID to its full form.
pub const fn from_u16(alias: u16) -> Uuid {
    Uuid::from_u128(BASE | (alias as u128) << 96)
}

/// The 16-bit alias of `uuid`, if it is a SIG-assigned short UUID.
pub fn to_u16(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_MASK != BASE {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Bluetooth GATT Service 16-bit UUIDs
pub mod services {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::from_u16;

    pub const GENERIC_ACCESS: Uuid = from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: Uuid = from_u16(0x1801);
    pub const IMMEDIATE_ALERT: Uuid = from_u16(0x1802);
    pub const LINK_LOSS: Uuid = from_u16(0x1803);
    pub const TX_POWER: Uuid = from_u16(0x1804);
    pub const DEVICE_INFORMATION: Uuid = from_u16(0x180A);
    pub const HEART_RATE: Uuid = from_u16(0x180D);
    pub const BATTERY: Uuid = from_u16(0x180F);
}

/// Bluetooth GATT Characteristic 16-bit UUIDs
pub mod characteristics {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::from_u16;

    pub const DEVICE_NAME: Uuid = from_u16(0x2A00);
    pub const APPEARANCE: Uuid = from_u16(0x2A01);
    pub const PERIPHERAL_PREFERRED_CONNECTION_PARAMETERS: Uuid = from_u16(0x2A04);
    pub const SERVICE_CHANGED: Uuid = from_u16(0x2A05);
    pub const BATTERY_LEVEL: Uuid = from_u16(0x2A19);
    pub const MODEL_NUMBER_STRING: Uuid = from_u16(0x2A24);
    pub const SERIAL_NUMBER_STRING: Uuid = from_u16(0x2A25);
    pub const FIRMWARE_REVISION_STRING: Uuid = from_u16(0x2A26);
    pub const HARDWARE_REVISION_STRING: Uuid = from_u16(0x2A27);
    pub const SOFTWARE_REVISION_STRING: Uuid = from_u16(0x2A28);
    pub const MANUFACTURER_NAME_STRING: Uuid = from_u16(0x2A29);
    pub const HEART_RATE_MEASUREMENT: Uuid = from_u16(0x2A37);
}

/// Bluetooth GATT Descriptor 16-bit UUIDs
pub mod descriptors {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::from_u16;

    pub const CHARACTERISTIC_EXTENDED_PROPERTIES: Uuid = from_u16(0x2900);
    pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = from_u16(0x2901);
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = from_u16(0x2902);
    pub const SERVER_CHARACTERISTIC_CONFIGURATION: Uuid = from_u16(0x2903);
    pub const CHARACTERISTIC_PRESENTATION_FORMAT: Uuid = from_u16(0x2904);
    pub const CHARACTERISTIC_AGGREGATE_FORMAT: Uuid = from_u16(0x2905);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_and_shrink() {
        let cccd = from_u16(0x2902);
        assert_eq!(
            cccd,
            "00002902-0000-1000-8000-00805f9b34fb".parse::<Uuid>().unwrap()
        );
        assert_eq!(to_u16(cccd), Some(0x2902));
        assert_eq!(to_u16(BLUETOOTH_BASE_UUID), Some(0));
    }

    #[test]
    fn foreign_uuids_have_no_alias() {
        // Vendor UUID outside the base range.
        let vendor = Uuid::from_u128(0x0000fe78_1212_efde_1523_785fef13d123);
        assert_eq!(to_u16(vendor), None);

        // In the base range but wider than 16 bits.
        let wide = Uuid::from_u128(BASE | (0x0001_0000u128) << 96);
        assert_eq!(to_u16(wide), None);
    }

    #[test]
    fn assigned_numbers_spot_check() {
        assert_eq!(to_u16(services::GENERIC_ACCESS), Some(0x1800));
        assert_eq!(to_u16(characteristics::DEVICE_NAME), Some(0x2A00));
        assert_eq!(
            to_u16(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION),
            Some(0x2902)
        );
    }
}
