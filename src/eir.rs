//! Advertising / scan-response data aggregation (Extended Inquiry Response).
//!
//! An [`EInfoReport`] is the merged view of one remote peer's advertising
//! data. Individual reports (AD_IND, AD_SCAN_RSP, ...) are parsed from their
//! AD structure TLVs and folded into the merged view with
//! [`EInfoReport::set`], which reports exactly which fields changed.
//!
//! AD structure types are assigned in the [GAP assigned numbers][gap]
//! document.
//!
//! [gap]: https://www.bluetooth.com/specifications/assigned-numbers/

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use uuid::Uuid;

use crate::address::{BDAddressType, EUI48};
use crate::btuuid;
use crate::bytes::{ByteReader, ByteWriter};
use crate::Result;

bitflags! {
    /// GAP discoverability and transport capability flags (AD type `0x01`).
    ///
    /// See the Bluetooth Core Specification Supplement, §A.1.3.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct GapFlags: u8 {
        /// LE Limited Discoverable mode.
        const LE_LTD_DISC = 0b00001;
        /// LE General Discoverable mode.
        const LE_GEN_DISC = 0b00010;
        /// BR/EDR not supported.
        const BREDR_UNSUP = 0b00100;
        /// Simultaneous LE and BR/EDR (controller).
        const DUAL_SAME_CTRL = 0b01000;
        /// Simultaneous LE and BR/EDR (host).
        const DUAL_SAME_HOST = 0b10000;
    }
}

bitflags! {
    /// Which fields of an [`EInfoReport`] carry a value.
    ///
    /// [`EInfoReport::set`] returns the sub-mask of fields that changed.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct EirDataType: u32 {
        /// Address type of the peer.
        const ADDRESS_TYPE = 1 << 0;
        /// Device address of the peer.
        const ADDRESS = 1 << 1;
        /// GAP flags.
        const FLAGS = 1 << 2;
        /// Complete local name.
        const NAME = 1 << 3;
        /// Shortened local name.
        const NAME_SHORT = 1 << 4;
        /// Received signal strength.
        const RSSI = 1 << 5;
        /// Transmit power level.
        const TX_POWER = 1 << 6;
        /// Manufacturer specific data.
        const MANUF_DATA = 1 << 7;
        /// BR/EDR class of device.
        const DEVICE_CLASS = 1 << 8;
        /// GAP appearance.
        const APPEARANCE = 1 << 9;
        /// Device ID profile record.
        const DEVICE_ID = 1 << 10;
        /// Preferred connection interval range.
        const CONN_IVAL = 1 << 11;
        /// Advertised service UUIDs.
        const SERVICE_UUID = 1 << 12;
    }
}

/// Where a report originated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EirSource {
    /// Not applicable / merged view.
    #[default]
    Na,
    /// Advertising indication (`ADV_IND` and friends).
    AdInd,
    /// Scan response (`SCAN_RSP`).
    AdScanRsp,
    /// BR/EDR extended inquiry response.
    Eir,
    /// Management layer synthesized report.
    EirMgmt,
}

/// USB-style device identity advertised via the Device ID profile.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceIdInfo {
    pub vendor_id_source: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u16,
}

/// AD structure type octets used by this stack.
mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_UUID16: u8 = 0x02;
    pub const COMPLETE_UUID16: u8 = 0x03;
    pub const INCOMPLETE_UUID128: u8 = 0x06;
    pub const COMPLETE_UUID128: u8 = 0x07;
    pub const NAME_SHORT: u8 = 0x08;
    pub const NAME: u8 = 0x09;
    pub const TX_POWER: u8 = 0x0a;
    pub const DEVICE_CLASS: u8 = 0x0d;
    pub const DEVICE_ID: u8 = 0x10;
    pub const CONN_IVAL_RANGE: u8 = 0x12;
    pub const APPEARANCE: u8 = 0x19;
    pub const MANUFACTURER_DATA: u8 = 0xff;
}

/// The aggregated advertising state of one remote peer.
///
/// Every field is paired with a bit in the set-mask; accessors return `None`
/// until a report supplied the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EInfoReport {
    source: EirSource,
    /// Monotonic milliseconds at reception.
    timestamp: u64,
    set_mask: EirDataType,
    address: EUI48,
    address_type: BDAddressType,
    flags: GapFlags,
    name: String,
    name_short: String,
    rssi: i8,
    tx_power: i8,
    manufacturer_data: HashMap<u16, Vec<u8>>,
    services: Vec<Uuid>,
    services_complete: bool,
    device_class: u32,
    appearance: u16,
    device_id: DeviceIdInfo,
    conn_interval_min: u16,
    conn_interval_max: u16,
}

impl EInfoReport {
    /// Creates an empty report tagged with its origin and reception time.
    pub fn new(source: EirSource, timestamp: u64) -> Self {
        EInfoReport {
            source,
            timestamp,
            ..Default::default()
        }
    }

    /// The origin of the newest data folded into this report.
    pub fn source(&self) -> EirSource {
        self.source
    }

    /// Monotonic milliseconds of the newest data folded into this report.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The mask of fields that carry a value.
    pub fn set_mask(&self) -> EirDataType {
        self.set_mask
    }

    fn is_set(&self, bit: EirDataType) -> bool {
        self.set_mask.contains(bit)
    }

    /// Sets the peer address.
    pub fn set_address(&mut self, address: EUI48) {
        self.address = address;
        self.set_mask |= EirDataType::ADDRESS;
    }

    /// Sets the peer address type.
    pub fn set_address_type(&mut self, address_type: BDAddressType) {
        self.address_type = address_type;
        self.set_mask |= EirDataType::ADDRESS_TYPE;
    }

    /// Replaces the GAP flags.
    pub fn set_flags(&mut self, flags: GapFlags) {
        self.flags = flags;
        self.set_mask |= EirDataType::FLAGS;
    }

    /// Adds `flags` to the present flag set.
    pub fn add_flags(&mut self, flags: GapFlags) {
        self.flags |= flags;
        self.set_mask |= EirDataType::FLAGS;
    }

    /// Sets the complete local name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.set_mask |= EirDataType::NAME;
    }

    /// Sets the shortened local name.
    pub fn set_name_short(&mut self, name: impl Into<String>) {
        self.name_short = name.into();
        self.set_mask |= EirDataType::NAME_SHORT;
    }

    /// Sets the received signal strength in dBm.
    pub fn set_rssi(&mut self, rssi: i8) {
        self.rssi = rssi;
        self.set_mask |= EirDataType::RSSI;
    }

    /// Sets the advertised transmit power in dBm.
    pub fn set_tx_power(&mut self, tx_power: i8) {
        self.tx_power = tx_power;
        self.set_mask |= EirDataType::TX_POWER;
    }

    /// Stores manufacturer data for one company ID (last write wins).
    pub fn set_manufacturer_data(&mut self, company_id: u16, data: impl Into<Vec<u8>>) {
        self.manufacturer_data.insert(company_id, data.into());
        self.set_mask |= EirDataType::MANUF_DATA;
    }

    /// Appends a service UUID, deduplicated.
    pub fn add_service(&mut self, uuid: Uuid) {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
        self.set_mask |= EirDataType::SERVICE_UUID;
    }

    /// Marks the advertised service list complete or incomplete.
    pub fn set_services_complete(&mut self, complete: bool) {
        self.services_complete = complete;
        self.set_mask |= EirDataType::SERVICE_UUID;
    }

    /// Sets the BR/EDR class of device.
    pub fn set_device_class(&mut self, device_class: u32) {
        self.device_class = device_class;
        self.set_mask |= EirDataType::DEVICE_CLASS;
    }

    /// Sets the GAP appearance.
    pub fn set_appearance(&mut self, appearance: u16) {
        self.appearance = appearance;
        self.set_mask |= EirDataType::APPEARANCE;
    }

    /// Sets the Device ID profile record.
    pub fn set_device_id(&mut self, device_id: DeviceIdInfo) {
        self.device_id = device_id;
        self.set_mask |= EirDataType::DEVICE_ID;
    }

    /// Preferred connection interval range in 1.25 ms units.
    pub fn set_conn_interval(&mut self, min: u16, max: u16) {
        self.conn_interval_min = min;
        self.conn_interval_max = max;
        self.set_mask |= EirDataType::CONN_IVAL;
    }

    /// The peer address, if set.
    pub fn address(&self) -> Option<EUI48> {
        self.is_set(EirDataType::ADDRESS).then_some(self.address)
    }

    /// The peer address type, if set.
    pub fn address_type(&self) -> Option<BDAddressType> {
        self.is_set(EirDataType::ADDRESS_TYPE)
            .then_some(self.address_type)
    }

    /// The GAP flags, if set.
    pub fn flags(&self) -> Option<GapFlags> {
        self.is_set(EirDataType::FLAGS).then_some(self.flags)
    }

    /// The complete local name, if set.
    pub fn name(&self) -> Option<&str> {
        self.is_set(EirDataType::NAME).then_some(self.name.as_str())
    }

    /// The shortened local name, if set.
    pub fn name_short(&self) -> Option<&str> {
        self.is_set(EirDataType::NAME_SHORT)
            .then_some(self.name_short.as_str())
    }

    /// The received signal strength in dBm, if set.
    pub fn rssi(&self) -> Option<i8> {
        self.is_set(EirDataType::RSSI).then_some(self.rssi)
    }

    /// The advertised transmit power in dBm, if set.
    pub fn tx_power(&self) -> Option<i8> {
        self.is_set(EirDataType::TX_POWER).then_some(self.tx_power)
    }

    /// Manufacturer data per company ID.
    pub fn manufacturer_data(&self) -> Option<&HashMap<u16, Vec<u8>>> {
        self.is_set(EirDataType::MANUF_DATA)
            .then_some(&self.manufacturer_data)
    }

    /// The advertised service UUIDs, if set.
    pub fn services(&self) -> Option<&[Uuid]> {
        self.is_set(EirDataType::SERVICE_UUID)
            .then_some(self.services.as_slice())
    }

    /// Whether the advertised service list was marked complete.
    pub fn services_complete(&self) -> bool {
        self.services_complete
    }

    /// The BR/EDR class of device, if set.
    pub fn device_class(&self) -> Option<u32> {
        self.is_set(EirDataType::DEVICE_CLASS)
            .then_some(self.device_class)
    }

    /// The GAP appearance, if set.
    pub fn appearance(&self) -> Option<u16> {
        self.is_set(EirDataType::APPEARANCE).then_some(self.appearance)
    }

    /// The Device ID profile record, if set.
    pub fn device_id(&self) -> Option<DeviceIdInfo> {
        self.is_set(EirDataType::DEVICE_ID).then_some(self.device_id)
    }

    /// Preferred connection interval range in 1.25 ms units.
    pub fn conn_interval(&self) -> Option<(u16, u16)> {
        self.is_set(EirDataType::CONN_IVAL)
            .then_some((self.conn_interval_min, self.conn_interval_max))
    }

    /// Merges `other` into `self` field-by-field and returns the mask of
    /// fields that changed.
    ///
    /// Only fields set in `other` are considered; a field is overwritten (and
    /// reported) only when it was unset here or carries a different value.
    /// Manufacturer data merges per company ID, service UUIDs are
    /// deduplicated. Source and timestamp follow `other` without being
    /// reported in the mask.
    pub fn set(&mut self, other: &EInfoReport) -> EirDataType {
        let mut changed = EirDataType::empty();
        let mut update = |bit: EirDataType, differs: bool| {
            if other.set_mask.contains(bit) && (!self.set_mask.contains(bit) || differs) {
                changed |= bit;
            }
        };

        update(EirDataType::ADDRESS, self.address != other.address);
        update(
            EirDataType::ADDRESS_TYPE,
            self.address_type != other.address_type,
        );
        update(EirDataType::FLAGS, self.flags != other.flags);
        update(EirDataType::NAME, self.name != other.name);
        update(EirDataType::NAME_SHORT, self.name_short != other.name_short);
        update(EirDataType::RSSI, self.rssi != other.rssi);
        update(EirDataType::TX_POWER, self.tx_power != other.tx_power);
        update(
            EirDataType::DEVICE_CLASS,
            self.device_class != other.device_class,
        );
        update(EirDataType::APPEARANCE, self.appearance != other.appearance);
        update(EirDataType::DEVICE_ID, self.device_id != other.device_id);
        update(
            EirDataType::CONN_IVAL,
            (self.conn_interval_min, self.conn_interval_max)
                != (other.conn_interval_min, other.conn_interval_max),
        );

        if changed.contains(EirDataType::ADDRESS) {
            self.address = other.address;
        }
        if changed.contains(EirDataType::ADDRESS_TYPE) {
            self.address_type = other.address_type;
        }
        if changed.contains(EirDataType::FLAGS) {
            self.flags = other.flags;
        }
        if changed.contains(EirDataType::NAME) {
            self.name.clone_from(&other.name);
        }
        if changed.contains(EirDataType::NAME_SHORT) {
            self.name_short.clone_from(&other.name_short);
        }
        if changed.contains(EirDataType::RSSI) {
            self.rssi = other.rssi;
        }
        if changed.contains(EirDataType::TX_POWER) {
            self.tx_power = other.tx_power;
        }
        if changed.contains(EirDataType::DEVICE_CLASS) {
            self.device_class = other.device_class;
        }
        if changed.contains(EirDataType::APPEARANCE) {
            self.appearance = other.appearance;
        }
        if changed.contains(EirDataType::DEVICE_ID) {
            self.device_id = other.device_id;
        }
        if changed.contains(EirDataType::CONN_IVAL) {
            self.conn_interval_min = other.conn_interval_min;
            self.conn_interval_max = other.conn_interval_max;
        }

        if other.set_mask.contains(EirDataType::MANUF_DATA) {
            for (company_id, data) in &other.manufacturer_data {
                if self.manufacturer_data.get(company_id) != Some(data) {
                    self.manufacturer_data.insert(*company_id, data.clone());
                    changed |= EirDataType::MANUF_DATA;
                }
            }
        }
        if other.set_mask.contains(EirDataType::SERVICE_UUID) {
            for uuid in &other.services {
                if !self.services.contains(uuid) {
                    self.services.push(*uuid);
                    changed |= EirDataType::SERVICE_UUID;
                }
            }
            if self.services_complete != other.services_complete {
                self.services_complete = other.services_complete;
                changed |= EirDataType::SERVICE_UUID;
            }
        }

        self.set_mask |= changed;
        self.source = other.source;
        self.timestamp = other.timestamp;
        changed
    }

    /// Parses AD structure TLVs into this report. Unknown types are skipped.
    pub fn read_data(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        while !reader.is_empty() {
            let len = reader.read_u8()? as usize;
            if len == 0 {
                // Early termination of significant part.
                break;
            }
            let segment = reader.read_slice(len)?;
            let ty = segment[0];
            let payload = &segment[1..];
            self.read_segment(ty, payload);
        }
        Ok(())
    }

    fn read_segment(&mut self, ty: u8, payload: &[u8]) {
        match ty {
            ad_type::FLAGS if !payload.is_empty() => {
                self.set_flags(GapFlags::from_bits_truncate(payload[0]));
            }
            ad_type::INCOMPLETE_UUID16 | ad_type::COMPLETE_UUID16 => {
                for chunk in payload.chunks_exact(2) {
                    self.add_service(btuuid::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
                self.set_services_complete(ty == ad_type::COMPLETE_UUID16);
            }
            ad_type::INCOMPLETE_UUID128 | ad_type::COMPLETE_UUID128 => {
                for chunk in payload.chunks_exact(16) {
                    let mut be: [u8; 16] = chunk.try_into().unwrap();
                    be.reverse();
                    self.add_service(Uuid::from_bytes(be));
                }
                self.set_services_complete(ty == ad_type::COMPLETE_UUID128);
            }
            ad_type::NAME_SHORT => {
                self.set_name_short(String::from_utf8_lossy(payload).into_owned());
            }
            ad_type::NAME => {
                self.set_name(String::from_utf8_lossy(payload).into_owned());
            }
            ad_type::TX_POWER if !payload.is_empty() => {
                self.set_tx_power(payload[0] as i8);
            }
            ad_type::DEVICE_CLASS if payload.len() >= 3 => {
                self.set_device_class(u32::from_le_bytes([
                    payload[0], payload[1], payload[2], 0,
                ]));
            }
            ad_type::DEVICE_ID if payload.len() >= 8 => {
                self.set_device_id(DeviceIdInfo {
                    vendor_id_source: u16::from_le_bytes([payload[0], payload[1]]),
                    vendor_id: u16::from_le_bytes([payload[2], payload[3]]),
                    product_id: u16::from_le_bytes([payload[4], payload[5]]),
                    version: u16::from_le_bytes([payload[6], payload[7]]),
                });
            }
            ad_type::CONN_IVAL_RANGE if payload.len() >= 4 => {
                self.set_conn_interval(
                    u16::from_le_bytes([payload[0], payload[1]]),
                    u16::from_le_bytes([payload[2], payload[3]]),
                );
            }
            ad_type::APPEARANCE if payload.len() >= 2 => {
                self.set_appearance(u16::from_le_bytes([payload[0], payload[1]]));
            }
            ad_type::MANUFACTURER_DATA if payload.len() >= 2 => {
                self.set_manufacturer_data(
                    u16::from_le_bytes([payload[0], payload[1]]),
                    payload[2..].to_vec(),
                );
            }
            _ => {}
        }
    }

    /// Emits the fields selected by `mask` (intersected with the set-mask) as
    /// AD structure TLVs.
    ///
    /// Fails with an EOF error when the data does not fit `writer`, e.g. the
    /// 31-octet legacy advertising payload.
    pub fn to_bytes(&self, writer: &mut ByteWriter<'_>, mask: EirDataType) -> Result<()> {
        let mask = mask & self.set_mask;
        let mut segment = |writer: &mut ByteWriter<'_>, ty: u8, payload: &[u8]| -> Result<()> {
            writer.write_u8((payload.len() + 1) as u8)?;
            writer.write_u8(ty)?;
            writer.write_slice(payload)
        };

        if mask.contains(EirDataType::FLAGS) {
            segment(writer, ad_type::FLAGS, &[self.flags.bits()])?;
        }
        if mask.contains(EirDataType::SERVICE_UUID) && !self.services.is_empty() {
            let mut uuid16 = Vec::new();
            let mut uuid128 = Vec::new();
            for uuid in &self.services {
                match btuuid::to_u16(*uuid) {
                    Some(v) => uuid16.extend_from_slice(&v.to_le_bytes()),
                    None => {
                        let mut le = *uuid.as_bytes();
                        le.reverse();
                        uuid128.extend_from_slice(&le);
                    }
                }
            }
            let (t16, t128) = if self.services_complete {
                (ad_type::COMPLETE_UUID16, ad_type::COMPLETE_UUID128)
            } else {
                (ad_type::INCOMPLETE_UUID16, ad_type::INCOMPLETE_UUID128)
            };
            if !uuid16.is_empty() {
                segment(writer, t16, &uuid16)?;
            }
            if !uuid128.is_empty() {
                segment(writer, t128, &uuid128)?;
            }
        }
        if mask.contains(EirDataType::NAME) {
            segment(writer, ad_type::NAME, self.name.as_bytes())?;
        }
        if mask.contains(EirDataType::NAME_SHORT) {
            segment(writer, ad_type::NAME_SHORT, self.name_short.as_bytes())?;
        }
        if mask.contains(EirDataType::TX_POWER) {
            segment(writer, ad_type::TX_POWER, &[self.tx_power as u8])?;
        }
        if mask.contains(EirDataType::CONN_IVAL) {
            let mut payload = [0; 4];
            payload[..2].copy_from_slice(&self.conn_interval_min.to_le_bytes());
            payload[2..].copy_from_slice(&self.conn_interval_max.to_le_bytes());
            segment(writer, ad_type::CONN_IVAL_RANGE, &payload)?;
        }
        if mask.contains(EirDataType::APPEARANCE) {
            segment(writer, ad_type::APPEARANCE, &self.appearance.to_le_bytes())?;
        }
        if mask.contains(EirDataType::MANUF_DATA) {
            for (company_id, data) in &self.manufacturer_data {
                let mut payload = company_id.to_le_bytes().to_vec();
                payload.extend_from_slice(data);
                segment(writer, ad_type::MANUFACTURER_DATA, &payload)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for EInfoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EInfoReport[{:?} @{}ms", self.source, self.timestamp)?;
        if let Some(address) = self.address() {
            write!(f, ", {address}")?;
        }
        if let Some(name) = self.name() {
            write!(f, ", '{name}'")?;
        }
        if let Some(rssi) = self.rssi() {
            write!(f, ", {rssi}dBm")?;
        }
        write!(f, ", set {:?}]", self.set_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_a() -> EInfoReport {
        let mut eir = EInfoReport::new(EirSource::AdInd, 1000);
        eir.set_address("01:02:03:04:05:06".parse().unwrap());
        eir.set_address_type(BDAddressType::LePublic);
        eir.set_rssi(-60);
        eir.set_flags(GapFlags::LE_GEN_DISC | GapFlags::BREDR_UNSUP);
        eir.add_service(btuuid::services::HEART_RATE);
        eir
    }

    #[test]
    fn merge_is_idempotent() {
        let mut merged = EInfoReport::default();
        let a = report_a();
        let first = merged.set(&a);
        assert!(!first.is_empty());
        assert_eq!(merged.set(&a), EirDataType::empty());
    }

    #[test]
    fn merge_of_disjoint_fields_commutes() {
        let a = report_a();
        let mut b = EInfoReport::new(EirSource::AdScanRsp, 1010);
        b.set_name("Polar H10");
        b.set_tx_power(4);

        let mut ab = EInfoReport::default();
        ab.set(&a);
        ab.set(&b);
        let mut ba = EInfoReport::default();
        ba.set(&b);
        ba.set(&a);

        // Source/timestamp track the newest contribution; data must agree.
        ba.source = ab.source;
        ba.timestamp = ab.timestamp;
        assert_eq!(ab, ba);
    }

    #[test]
    fn merge_reports_only_differences() {
        let mut merged = EInfoReport::default();
        merged.set(&report_a());

        let mut update = EInfoReport::new(EirSource::AdInd, 1020);
        update.set_rssi(-58);
        update.set_address("01:02:03:04:05:06".parse().unwrap());
        assert_eq!(merged.set(&update), EirDataType::RSSI);
        assert_eq!(merged.rssi(), Some(-58));
    }

    #[test]
    fn manufacturer_data_merges_per_company() {
        let mut merged = EInfoReport::default();
        let mut a = EInfoReport::default();
        a.set_manufacturer_data(0x004c, vec![1, 2]);
        merged.set(&a);

        let mut b = EInfoReport::default();
        b.set_manufacturer_data(0x0059, vec![3]);
        assert_eq!(merged.set(&b), EirDataType::MANUF_DATA);

        let mut c = EInfoReport::default();
        c.set_manufacturer_data(0x004c, vec![1, 2]);
        assert_eq!(merged.set(&c), EirDataType::empty());

        let data = merged.manufacturer_data().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[&0x004c], vec![1, 2]);
    }

    #[test]
    fn services_deduplicate() {
        let mut merged = EInfoReport::default();
        merged.set(&report_a());
        let mut again = report_a();
        again.add_service(btuuid::services::BATTERY);
        assert_eq!(merged.set(&again), EirDataType::SERVICE_UUID);
        assert_eq!(merged.services().unwrap().len(), 2);
    }

    #[test]
    fn parse_sample_payload() {
        // flags, complete 16-bit uuid list, complete name, tx power
        let data = [
            0x02, 0x01, 0x06, //
            0x03, 0x03, 0x0d, 0x18, //
            0x05, 0x09, b'T', b'e', b's', b't', //
            0x02, 0x0a, 0xf4,
        ];
        let mut eir = EInfoReport::new(EirSource::AdInd, 0);
        eir.read_data(&data).unwrap();
        assert_eq!(
            eir.flags(),
            Some(GapFlags::LE_GEN_DISC | GapFlags::BREDR_UNSUP)
        );
        assert_eq!(eir.services(), Some(&[btuuid::services::HEART_RATE][..]));
        assert!(eir.services_complete());
        assert_eq!(eir.name(), Some("Test"));
        assert_eq!(eir.tx_power(), Some(-12));
    }

    #[test]
    fn emit_parse_round_trip() {
        let mut eir = EInfoReport::new(EirSource::AdInd, 0);
        eir.set_flags(GapFlags::LE_GEN_DISC);
        eir.set_name("bluedirect");
        eir.add_service(btuuid::services::BATTERY);
        eir.set_services_complete(true);

        let mut buf = [0; 31];
        let mut writer = ByteWriter::new(&mut buf);
        eir.to_bytes(&mut writer, EirDataType::all()).unwrap();
        let len = writer.bytes_written();

        let mut parsed = EInfoReport::new(EirSource::AdInd, 0);
        parsed.read_data(&buf[..len]).unwrap();
        assert_eq!(parsed.flags(), Some(GapFlags::LE_GEN_DISC));
        assert_eq!(parsed.name(), Some("bluedirect"));
        assert_eq!(parsed.services(), Some(&[btuuid::services::BATTERY][..]));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut eir = EInfoReport::new(EirSource::AdInd, 0);
        eir.set_name("a name that is far too long for a legacy advertising payload");
        let mut buf = [0; 31];
        let mut writer = ByteWriter::new(&mut buf);
        assert!(eir.to_bytes(&mut writer, EirDataType::all()).is_err());
    }
}
