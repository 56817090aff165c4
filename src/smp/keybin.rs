//! Persistent storage of SMP key material, one record per bonded peer.
//!
//! A [`SmpKeyBin`] snapshots the negotiated security parameters and every key
//! distributed during pairing. Records are written to `.key` files named
//! `bd_<local-addr-hex>_<remote-addr-hex><remote-type-digit>.key` and uploaded
//! before reconnecting to resume the bond without a new SMP exchange.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::address::{BDAddressAndType, BDAddressType, EUI48};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::device::Device;
use crate::error::{Error, ErrorKind};
use crate::hci::HciStatus;
use crate::smp::{
    BtSecurityLevel, KeyDirection, PairingMode, SmpIdentityResolvingKey, SmpIoCapability,
    SmpKeyMask, SmpLinkKey, SmpLongTermKey, SmpPairingState, SmpSignatureResolvingKey,
};
use crate::Result;

impl ToBytes for BDAddressAndType {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        writer.write_slice(&self.address.b)?;
        writer.write_u8(self.address_type as u8)
    }
}

impl FromBytes for BDAddressAndType {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(BDAddressAndType {
            address: EUI48::new(reader.read_array()?),
            address_type: BDAddressType::from_u8(reader.read_u8()?),
        })
    }
}

/// Per-direction key slots of one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct KeySet {
    mask: SmpKeyMask,
    ltk: SmpLongTermKey,
    irk: SmpIdentityResolvingKey,
    csrk: SmpSignatureResolvingKey,
    lk: SmpLinkKey,
}

impl KeySet {
    fn size(&self) -> usize {
        let mut size = 0;
        if self.mask.contains(SmpKeyMask::ENC_KEY) {
            size += SmpLongTermKey::SIZE;
        }
        if self.mask.contains(SmpKeyMask::ID_KEY) {
            size += SmpIdentityResolvingKey::SIZE;
        }
        if self.mask.contains(SmpKeyMask::SIGN_KEY) {
            size += SmpSignatureResolvingKey::SIZE;
        }
        if self.mask.contains(SmpKeyMask::LINK_KEY) {
            size += SmpLinkKey::SIZE;
        }
        size
    }

    fn keys_valid(&self) -> bool {
        (!self.mask.contains(SmpKeyMask::ENC_KEY) || self.ltk.is_valid())
            && (!self.mask.contains(SmpKeyMask::LINK_KEY) || self.lk.is_valid())
    }

    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        if self.mask.contains(SmpKeyMask::ENC_KEY) {
            self.ltk.to_bytes(writer)?;
        }
        if self.mask.contains(SmpKeyMask::ID_KEY) {
            self.irk.to_bytes(writer)?;
        }
        if self.mask.contains(SmpKeyMask::SIGN_KEY) {
            self.csrk.to_bytes(writer)?;
        }
        if self.mask.contains(SmpKeyMask::LINK_KEY) {
            self.lk.to_bytes(writer)?;
        }
        Ok(())
    }

    fn from_bytes(mask: SmpKeyMask, reader: &mut ByteReader<'_>) -> Result<Self> {
        let mut set = KeySet {
            mask,
            ..KeySet::default()
        };
        if mask.contains(SmpKeyMask::ENC_KEY) {
            set.ltk = SmpLongTermKey::from_bytes(reader)?;
        }
        if mask.contains(SmpKeyMask::ID_KEY) {
            set.irk = SmpIdentityResolvingKey::from_bytes(reader)?;
        }
        if mask.contains(SmpKeyMask::SIGN_KEY) {
            set.csrk = SmpSignatureResolvingKey::from_bytes(reader)?;
        }
        if mask.contains(SmpKeyMask::LINK_KEY) {
            set.lk = SmpLinkKey::from_bytes(reader)?;
        }
        Ok(set)
    }
}

/// A persistable snapshot of the key material bonded with one remote peer.
///
/// File format version 5. All multi-byte fields little-endian:
///
/// | octets | field |
/// |---|---|
/// | 2 | version magic (`0b0101010101010101 + 5`) |
/// | 2 | total size |
/// | 8 | creation timestamp, Unix seconds |
/// | 7 | local address and type |
/// | 7 | remote address and type |
/// | 1 | security level |
/// | 1 | IO capability |
/// | 1 | initiator key mask |
/// | 1 | responder key mask |
/// | .. | masked keys: init LTK, IRK, CSRK, LK, then resp LTK, IRK, CSRK, LK |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpKeyBin {
    version: u16,
    size: u16,
    ts_creation_sec: u64,
    local_address: BDAddressAndType,
    remote_address: BDAddressAndType,
    sec_level: BtSecurityLevel,
    io_cap: SmpIoCapability,
    init: KeySet,
    resp: KeySet,
}

impl SmpKeyBin {
    /// Version magic of the supported file format.
    pub const VERSION: u16 = 0b0101010101010101 + 5;

    /// Size of the fixed prefix in octets.
    pub const MIN_SIZE: usize = 2 + 2 + 8 + 7 + 7 + 1 + 1 + 1 + 1;

    /// Size with every key slot of both directions populated.
    pub const MAX_SIZE: usize = Self::MIN_SIZE
        + 2 * (SmpLongTermKey::SIZE
            + SmpIdentityResolvingKey::SIZE
            + SmpSignatureResolvingKey::SIZE
            + SmpLinkKey::SIZE);

    /// Creates an empty record for the given identity pair.
    pub fn new(local: BDAddressAndType, remote: BDAddressAndType) -> Self {
        let ts_creation_sec = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut keybin = SmpKeyBin {
            version: Self::VERSION,
            size: 0,
            ts_creation_sec,
            local_address: local,
            remote_address: remote,
            sec_level: BtSecurityLevel::Unset,
            io_cap: SmpIoCapability::Unset,
            init: KeySet::default(),
            resp: KeySet::default(),
        };
        keybin.size = keybin.calc_size();
        keybin
    }

    /// Snapshots the live `device`'s negotiated security parameters and every
    /// available key into a fresh record.
    ///
    /// The snapshot is valid only when the device is either fully paired
    /// (`Completed` state, security level above `None`, settled pairing mode)
    /// or fully unpaired; any in-between state yields an invalid record.
    pub fn create(device: &Device) -> Self {
        let local = match device.adapter() {
            Some(adapter) => adapter.address_and_type(),
            None => BDAddressAndType::ANY,
        };
        let mut keybin = SmpKeyBin::new(local, device.address_and_type());
        // A never-secured device reads as level None for the snapshot rule.
        keybin.sec_level = match device.sec_level() {
            BtSecurityLevel::Unset => BtSecurityLevel::None,
            level => level,
        };
        keybin.io_cap = device.io_capability();

        for (dir, set) in [
            (KeyDirection::Initiator, &mut keybin.init),
            (KeyDirection::Responder, &mut keybin.resp),
        ] {
            let mask = device.available_keys(dir);
            if mask.contains(SmpKeyMask::ENC_KEY) {
                if let Some(ltk) = device.long_term_key(dir) {
                    set.ltk = ltk;
                    set.mask |= SmpKeyMask::ENC_KEY;
                }
            }
            if mask.contains(SmpKeyMask::ID_KEY) {
                if let Some(irk) = device.identity_resolving_key(dir) {
                    set.irk = irk;
                    set.mask |= SmpKeyMask::ID_KEY;
                }
            }
            if mask.contains(SmpKeyMask::SIGN_KEY) {
                if let Some(csrk) = device.signature_resolving_key(dir) {
                    set.csrk = csrk;
                    set.mask |= SmpKeyMask::SIGN_KEY;
                }
            }
            if mask.contains(SmpKeyMask::LINK_KEY) {
                if let Some(lk) = device.link_key(dir) {
                    set.lk = lk;
                    set.mask |= SmpKeyMask::LINK_KEY;
                }
            }
        }
        keybin.size = keybin.calc_size();

        let state = device.pairing_state();
        let mode = device.pairing_mode();
        let paired = state == SmpPairingState::Completed
            && keybin.sec_level > BtSecurityLevel::None
            && mode > PairingMode::Negotiating;
        let unpaired = state == SmpPairingState::None
            && keybin.sec_level == BtSecurityLevel::None
            && mode == PairingMode::None;
        if !paired && !unpaired {
            // Marks the snapshot invalid; write() will refuse it.
            keybin.version = 0;
        }
        keybin
    }

    /// Total record size computed from the key masks.
    fn calc_size(&self) -> u16 {
        (Self::MIN_SIZE + self.init.size() + self.resp.size()) as u16
    }

    /// Whether this record may be persisted and applied.
    pub fn is_valid(&self) -> bool {
        self.version == Self::VERSION
            && self.size == self.calc_size()
            && self.init.keys_valid()
            && self.resp.keys_valid()
    }

    /// The local adapter identity the record was created on.
    pub fn local_address(&self) -> BDAddressAndType {
        self.local_address
    }

    /// The remote peer identity the record belongs to.
    pub fn remote_address(&self) -> BDAddressAndType {
        self.remote_address
    }

    /// Negotiated security level at creation time.
    pub fn sec_level(&self) -> BtSecurityLevel {
        self.sec_level
    }

    /// Negotiated IO capability at creation time.
    pub fn io_cap(&self) -> SmpIoCapability {
        self.io_cap
    }

    /// Creation time in Unix seconds.
    pub fn ts_creation_sec(&self) -> u64 {
        self.ts_creation_sec
    }

    /// Encoded record size in octets.
    pub fn size(&self) -> u16 {
        self.size
    }

    fn set(&mut self, dir: KeyDirection) -> &mut KeySet {
        match dir {
            KeyDirection::Initiator => &mut self.init,
            KeyDirection::Responder => &mut self.resp,
        }
    }

    fn get(&self, dir: KeyDirection) -> &KeySet {
        match dir {
            KeyDirection::Initiator => &self.init,
            KeyDirection::Responder => &self.resp,
        }
    }

    /// Key classes present for `dir`.
    pub fn keys(&self, dir: KeyDirection) -> SmpKeyMask {
        self.get(dir).mask
    }

    /// Stores a long-term key, marking it present in the mask.
    pub fn set_long_term_key(&mut self, dir: KeyDirection, ltk: SmpLongTermKey) {
        let set = self.set(dir);
        set.ltk = ltk;
        set.mask |= SmpKeyMask::ENC_KEY;
        self.size = self.calc_size();
    }

    /// Stores an identity resolving key, marking it present in the mask.
    pub fn set_identity_resolving_key(&mut self, dir: KeyDirection, irk: SmpIdentityResolvingKey) {
        let set = self.set(dir);
        set.irk = irk;
        set.mask |= SmpKeyMask::ID_KEY;
        self.size = self.calc_size();
    }

    /// Stores a signature resolving key, marking it present in the mask.
    pub fn set_signature_resolving_key(
        &mut self,
        dir: KeyDirection,
        csrk: SmpSignatureResolvingKey,
    ) {
        let set = self.set(dir);
        set.csrk = csrk;
        set.mask |= SmpKeyMask::SIGN_KEY;
        self.size = self.calc_size();
    }

    /// Stores a link key, marking it present in the mask.
    pub fn set_link_key(&mut self, dir: KeyDirection, lk: SmpLinkKey) {
        let set = self.set(dir);
        set.lk = lk;
        set.mask |= SmpKeyMask::LINK_KEY;
        self.size = self.calc_size();
    }

    /// The long-term key for `dir`, if present.
    pub fn long_term_key(&self, dir: KeyDirection) -> Option<SmpLongTermKey> {
        let set = self.get(dir);
        set.mask.contains(SmpKeyMask::ENC_KEY).then_some(set.ltk)
    }

    /// The identity resolving key for `dir`, if present.
    pub fn identity_resolving_key(&self, dir: KeyDirection) -> Option<SmpIdentityResolvingKey> {
        let set = self.get(dir);
        set.mask.contains(SmpKeyMask::ID_KEY).then_some(set.irk)
    }

    /// The signature resolving key for `dir`, if present.
    pub fn signature_resolving_key(&self, dir: KeyDirection) -> Option<SmpSignatureResolvingKey> {
        let set = self.get(dir);
        set.mask.contains(SmpKeyMask::SIGN_KEY).then_some(set.csrk)
    }

    /// The link key for `dir`, if present.
    pub fn link_key(&self, dir: KeyDirection) -> Option<SmpLinkKey> {
        let set = self.get(dir);
        set.mask.contains(SmpKeyMask::LINK_KEY).then_some(set.lk)
    }

    /// File name for this record:
    /// `bd_<local-addr-hex>_<remote-addr-hex><remote-type-digit>.key`.
    pub fn file_name(&self) -> String {
        format!(
            "bd_{}_{}{}.key",
            self.local_address.address.to_hex_string(),
            self.remote_address.address.to_hex_string(),
            self.remote_address.address_type as u8,
        )
    }

    /// Full path of this record below `dir`.
    pub fn file_path(&self, dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(self.file_name())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0; Self::MAX_SIZE];
        let mut writer = ByteWriter::new(&mut buf);
        writer.write_u16_le(self.version)?;
        writer.write_u16_le(self.size)?;
        writer.write_u64_le(self.ts_creation_sec)?;
        self.local_address.to_bytes(&mut writer)?;
        self.remote_address.to_bytes(&mut writer)?;
        writer.write_u8(self.sec_level as u8)?;
        writer.write_u8(self.io_cap as u8)?;
        writer.write_u8(self.init.mask.bits())?;
        writer.write_u8(self.resp.mask.bits())?;
        self.init.to_bytes(&mut writer)?;
        self.resp.to_bytes(&mut writer)?;
        let len = writer.bytes_written();
        buf.truncate(len);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let version = reader.read_u16_le()?;
        if version != Self::VERSION {
            return Err(Error::new(
                ErrorKind::InvalidFormat,
                format!("version magic {version:#06x}"),
            ));
        }
        let size = reader.read_u16_le()?;
        if size as usize != bytes.len() {
            return Err(Error::new(
                ErrorKind::InvalidFormat,
                format!("declared size {size}, have {}", bytes.len()),
            ));
        }
        let ts_creation_sec = reader.read_u64_le()?;
        let local_address = BDAddressAndType::from_bytes(&mut reader)?;
        let remote_address = BDAddressAndType::from_bytes(&mut reader)?;
        let sec_level = BtSecurityLevel::from_u8(reader.read_u8()?);
        let io_cap = SmpIoCapability::from_u8(reader.read_u8()?);
        let mask_init = SmpKeyMask::from_bits_truncate(reader.read_u8()?);
        let mask_resp = SmpKeyMask::from_bits_truncate(reader.read_u8()?);
        let init = KeySet::from_bytes(mask_init, &mut reader)?;
        let resp = KeySet::from_bytes(mask_resp, &mut reader)?;
        if !reader.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidFormat,
                format!("{} trailing bytes", reader.bytes_left()),
            ));
        }
        let keybin = SmpKeyBin {
            version,
            size,
            ts_creation_sec,
            local_address,
            remote_address,
            sec_level,
            io_cap,
            init,
            resp,
        };
        if !keybin.is_valid() {
            return Err(ErrorKind::InvalidFormat.into());
        }
        Ok(keybin)
    }

    /// Writes this record to `path`.
    ///
    /// Refuses an invalid record and refuses to replace an existing file
    /// unless `overwrite` is set. An existing file is deleted before the new
    /// one is created.
    pub fn write(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if !self.is_valid() {
            return Err(Error::new(
                ErrorKind::InvalidParameters,
                "refusing to write invalid key record",
            ));
        }
        if path.exists() {
            if !overwrite {
                return Err(Error::new(
                    ErrorKind::InvalidParameters,
                    format!("{} exists and overwrite is not set", path.display()),
                ));
            }
            fs::remove_file(path)?;
        }
        fs::write(path, self.encode()?)?;
        debug!(path = %path.display(), size = self.size, "stored SMP key record");
        Ok(())
    }

    /// Reads a record from `path`.
    ///
    /// Any mismatch (version magic, declared size, truncated or oversized key
    /// data) removes the file from disk and yields an error.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        match Self::decode(&bytes) {
            Ok(keybin) => {
                debug!(path = %path.display(), remote = %keybin.remote_address, "loaded SMP key record");
                Ok(keybin)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "removing corrupt SMP key record");
                let _ = fs::remove_file(path);
                Err(err)
            }
        }
    }

    /// Reads every valid `.key` record in `dir`, removing corrupt ones.
    pub fn read_all(dir: impl AsRef<Path>) -> Vec<SmpKeyBin> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(dir.as_ref()) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.as_ref().display(), %err, "cannot scan key directory");
                return records;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "key") {
                if let Ok(keybin) = Self::read(&path) {
                    records.push(keybin);
                }
            }
        }
        records
    }

    /// Uploads this record's security parameters and long-term keys to a not
    /// yet connected `device`, so the next connection comes up pre-paired.
    ///
    /// Returns [`HciStatus::InvalidParams`] for an invalid record and
    /// [`HciStatus::ConnectionAlreadyExists`] if the device is connected.
    pub fn apply(&self, device: &Device) -> HciStatus {
        if !self.is_valid() {
            return HciStatus::InvalidParams;
        }
        if device.is_connected() {
            return HciStatus::ConnectionAlreadyExists;
        }
        let status = device
            .set_connection_security(BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput);
        if status != HciStatus::Success {
            return status;
        }
        if let Some(ltk) = self.long_term_key(KeyDirection::Initiator) {
            let status = device.upload_long_term_key(ltk);
            if status != HciStatus::Success {
                return status;
            }
        }
        if let Some(ltk) = self.long_term_key(KeyDirection::Responder) {
            let status = device.upload_long_term_key(ltk);
            if status != HciStatus::Success {
                return status;
            }
        }
        HciStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::SmpLtkProperties;

    fn sample() -> SmpKeyBin {
        let local = BDAddressAndType::new(
            "C0:26:DA:01:DA:B1".parse().unwrap(),
            BDAddressType::LePublic,
        );
        let remote = BDAddressAndType::new(
            "D0:03:4B:11:22:33".parse().unwrap(),
            BDAddressType::LeRandom,
        );
        let mut keybin = SmpKeyBin::new(local, remote);
        keybin.sec_level = BtSecurityLevel::EncOnly;
        keybin.io_cap = SmpIoCapability::NoInputNoOutput;
        keybin
    }

    fn sample_ltk(responder: bool) -> SmpLongTermKey {
        SmpLongTermKey {
            properties: if responder {
                SmpLtkProperties::RESPONDER
            } else {
                SmpLtkProperties::empty()
            },
            enc_size: 16,
            ediv: 0xbeef,
            rand: 0x1122334455667788,
            ltk: [0x42; 16],
        }
    }

    #[test]
    fn init_ltk_only_record_is_58_octets() {
        let mut keybin = sample();
        keybin.set_long_term_key(KeyDirection::Initiator, sample_ltk(false));
        assert_eq!(keybin.size(), 58);
        assert!(keybin.is_valid());
    }

    #[test]
    fn file_name_convention() {
        let keybin = sample();
        assert_eq!(keybin.file_name(), "bd_c026da01dab1_d0034b1122332.key");
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut keybin = sample();
        keybin.set_long_term_key(KeyDirection::Initiator, sample_ltk(false));
        keybin.set_long_term_key(KeyDirection::Responder, sample_ltk(true));
        keybin.set_identity_resolving_key(
            KeyDirection::Responder,
            SmpIdentityResolvingKey {
                properties: Default::default(),
                irk: [7; 16],
            },
        );

        let path = keybin.file_path(dir.path());
        keybin.write(&path, false).unwrap();
        let loaded = SmpKeyBin::read(&path).unwrap();
        assert_eq!(loaded, keybin);
        assert!(path.exists());
    }

    #[test]
    fn write_refuses_existing_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let keybin = sample();
        let path = keybin.file_path(dir.path());
        keybin.write(&path, false).unwrap();
        assert_eq!(
            keybin.write(&path, false).unwrap_err().kind,
            ErrorKind::InvalidParameters
        );
        keybin.write(&path, true).unwrap();
    }

    #[test]
    fn corrupt_version_is_removed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let keybin = sample();
        let path = keybin.file_path(dir.path());
        keybin.write(&path, false).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(SmpKeyBin::read(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn truncated_record_is_removed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut keybin = sample();
        keybin.set_long_term_key(KeyDirection::Initiator, sample_ltk(false));
        let path = keybin.file_path(dir.path());
        keybin.write(&path, false).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..40]).unwrap();

        assert!(SmpKeyBin::read(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn wrong_size_field_is_removed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let keybin = sample();
        let path = keybin.file_path(dir.path());
        keybin.write(&path, false).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[2] = bytes[2].wrapping_add(1);
        fs::write(&path, &bytes).unwrap();

        assert!(SmpKeyBin::read(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn read_all_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = sample();
        a.set_long_term_key(KeyDirection::Initiator, sample_ltk(false));
        a.write(a.file_path(dir.path()), false).unwrap();

        let mut b = sample();
        b.remote_address = BDAddressAndType::new(
            "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            BDAddressType::LePublic,
        );
        let b_path = b.file_path(dir.path());
        b.write(&b_path, false).unwrap();
        fs::write(&b_path, b"garbage").unwrap();

        let records = SmpKeyBin::read_all(dir.path());
        assert_eq!(records, vec![a]);
        assert!(!b_path.exists());
    }
}
