//! Security Manager Protocol (SMP) types: pairing negotiation state, security
//! levels, and the key material exchanged during bonding.
//!
//! Key layouts are fixed and little-endian; they are the unit of persistence
//! for [`SmpKeyBin`][crate::smp::SmpKeyBin] records.
//!
//! See the Bluetooth Core Specification, Vol 3, Part H.

mod keybin;

pub use keybin::SmpKeyBin;

use bitflags::bitflags;

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::Result;

/// Security level of a connection, negotiated during pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BtSecurityLevel {
    /// Not negotiated yet.
    #[default]
    Unset = 0,
    /// No encryption and no authentication.
    None = 1,
    /// Encryption without authentication (unauthenticated pairing).
    EncOnly = 2,
    /// Encryption with authentication (authenticated pairing).
    EncAuth = 3,
    /// Authenticated LE Secure Connections pairing with encryption.
    EncAuthFips = 4,
}

impl BtSecurityLevel {
    /// Converts a raw octet, mapping out-of-range values to `Unset`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::None,
            2 => Self::EncOnly,
            3 => Self::EncAuth,
            4 => Self::EncAuthFips,
            _ => Self::Unset,
        }
    }
}

/// Bluetooth input/output capabilities for pairing
///
/// See the Bluetooth Core Specification, Vol 3, Part H, §2.3.2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SmpIoCapability {
    /// Can display a passkey but not accept user input
    DisplayOnly = 0,
    /// Can display a passkey and request simple confirmation from the user
    DisplayYesNo = 1,
    /// Can request a passkey from the user but not display anything
    KeyboardOnly = 2,
    /// Cannot display anything to or request anything from the user
    NoInputNoOutput = 3,
    /// Can display a passkey to and/or request a passkey or confirmation from the user
    KeyboardDisplay = 4,
    /// Not negotiated yet.
    #[default]
    Unset = 0xff,
}

impl SmpIoCapability {
    /// Converts a raw octet, mapping out-of-range values to `Unset`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::DisplayOnly,
            1 => Self::DisplayYesNo,
            2 => Self::KeyboardOnly,
            3 => Self::NoInputNoOutput,
            4 => Self::KeyboardDisplay,
            _ => Self::Unset,
        }
    }
}

/// The pairing mode selected once the SMP feature exchange has completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PairingMode {
    /// No pairing requested or performed.
    #[default]
    None,
    /// Feature exchange is still negotiating the mode.
    Negotiating,
    /// Unauthenticated pairing without user interaction.
    JustWorks,
    /// Passkey entry, this host being the initiator (displays or enters).
    PasskeyEntryIni,
    /// Passkey entry, this host being the responder.
    PasskeyEntryRes,
    /// Numeric comparison, this host being the initiator.
    NumericCompareIni,
    /// Numeric comparison, this host being the responder.
    NumericCompareRes,
    /// Out-of-band data exchange.
    OutOfBand,
    /// Link came up encrypted from previously distributed keys; SMP skipped.
    PrePaired,
}

/// States of the SMP pairing state machine for one connection.
///
/// `None → FeatureExchangeStarted → FeatureExchangeCompleted →` one of the
/// expectation states or `KeyDistribution` `→ Completed | Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SmpPairingState {
    /// No pairing in progress.
    #[default]
    None,
    /// Pairing request/response exchange has begun.
    FeatureExchangeStarted,
    /// Features agreed; the pairing mode is now known.
    FeatureExchangeCompleted,
    /// The user must supply a passkey via
    /// [`Device::set_pairing_passkey`][crate::Device::set_pairing_passkey].
    PasskeyExpected,
    /// The user must confirm the displayed value via
    /// [`Device::set_pairing_numeric_comparison`][crate::Device::set_pairing_numeric_comparison].
    NumericCompareExpected,
    /// Out-of-band data must be supplied.
    OobExpected,
    /// Authentication done; transport-specific keys are being distributed.
    KeyDistribution,
    /// Pairing finished successfully; key material is available.
    Completed,
    /// Pairing failed; see the accompanying status code.
    Failed,
}

impl SmpPairingState {
    /// Returns `true` for the states awaiting user input.
    pub fn is_expectation_state(self) -> bool {
        matches!(
            self,
            Self::PasskeyExpected | Self::NumericCompareExpected | Self::OobExpected
        )
    }
}

bitflags! {
    /// Which key classes are available for one direction of a bonded link.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct SmpKeyMask: u8 {
        /// Long-term key (encryption).
        const ENC_KEY = 0b0001;
        /// Identity resolving key.
        const ID_KEY = 0b0010;
        /// Signature resolving key.
        const SIGN_KEY = 0b0100;
        /// BR/EDR link key derived via LE Secure Connections.
        const LINK_KEY = 0b1000;
    }
}

/// The two directions key material is kept for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyDirection {
    /// Keys distributed by the initiator of the pairing.
    Initiator,
    /// Keys distributed by the responder.
    Responder,
}

bitflags! {
    /// Property bits of a [`SmpLongTermKey`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct SmpLtkProperties: u8 {
        /// Key was distributed by the responder.
        const RESPONDER = 0b001;
        /// Authenticated pairing (MITM protection).
        const AUTH = 0b010;
        /// LE Secure Connections pairing.
        const SC = 0b100;
    }
}

/// SMP long-term key, the encryption key of a bonded LE link.
///
/// Octet layout (28 octets, stable for persistence): properties, encryption
/// key size, EDIV (2), RAND (8), LTK (16); multi-byte fields little-endian.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmpLongTermKey {
    pub properties: SmpLtkProperties,
    /// Negotiated encryption key size in octets; zero marks an invalid key.
    pub enc_size: u8,
    pub ediv: u16,
    pub rand: u64,
    pub ltk: [u8; 16],
}

impl SmpLongTermKey {
    /// Encoded size in octets.
    pub const SIZE: usize = 28;

    /// A key with zero encryption size is invalid.
    pub fn is_valid(&self) -> bool {
        self.enc_size != 0
    }

    /// Whether the responder distributed this key.
    pub fn is_responder(&self) -> bool {
        self.properties.contains(SmpLtkProperties::RESPONDER)
    }
}

impl ToBytes for SmpLongTermKey {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        writer.write_u8(self.properties.bits())?;
        writer.write_u8(self.enc_size)?;
        writer.write_u16_le(self.ediv)?;
        writer.write_u64_le(self.rand)?;
        writer.write_slice(&self.ltk)
    }
}

impl FromBytes for SmpLongTermKey {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(SmpLongTermKey {
            properties: SmpLtkProperties::from_bits_truncate(reader.read_u8()?),
            enc_size: reader.read_u8()?,
            ediv: reader.read_u16_le()?,
            rand: reader.read_u64_le()?,
            ltk: reader.read_array()?,
        })
    }
}

bitflags! {
    /// Property bits shared by [`SmpIdentityResolvingKey`] and
    /// [`SmpSignatureResolvingKey`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct SmpKeyProperties: u8 {
        /// Key was distributed by the responder.
        const RESPONDER = 0b001;
        /// Authenticated pairing (MITM protection).
        const AUTH = 0b010;
    }
}

/// SMP identity resolving key, used to resolve resolvable private addresses.
///
/// Octet layout (17 octets): properties, IRK (16).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmpIdentityResolvingKey {
    pub properties: SmpKeyProperties,
    pub irk: [u8; 16],
}

impl SmpIdentityResolvingKey {
    /// Encoded size in octets.
    pub const SIZE: usize = 17;
}

impl ToBytes for SmpIdentityResolvingKey {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        writer.write_u8(self.properties.bits())?;
        writer.write_slice(&self.irk)
    }
}

impl FromBytes for SmpIdentityResolvingKey {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(SmpIdentityResolvingKey {
            properties: SmpKeyProperties::from_bits_truncate(reader.read_u8()?),
            irk: reader.read_array()?,
        })
    }
}

/// SMP signature resolving key, used for signed unencrypted writes.
///
/// Octet layout (17 octets): properties, CSRK (16).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmpSignatureResolvingKey {
    pub properties: SmpKeyProperties,
    pub csrk: [u8; 16],
}

impl SmpSignatureResolvingKey {
    /// Encoded size in octets.
    pub const SIZE: usize = 17;
}

impl ToBytes for SmpSignatureResolvingKey {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        writer.write_u8(self.properties.bits())?;
        writer.write_slice(&self.csrk)
    }
}

impl FromBytes for SmpSignatureResolvingKey {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(SmpSignatureResolvingKey {
            properties: SmpKeyProperties::from_bits_truncate(reader.read_u8()?),
            csrk: reader.read_array()?,
        })
    }
}

/// BR/EDR link key types per the Bluetooth Core Specification, Vol 2, Part E,
/// §7.7.24.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkKeyType {
    Combination = 0x00,
    LocalUnit = 0x01,
    RemoteUnit = 0x02,
    DebugCombination = 0x03,
    UnauthenticatedP192 = 0x04,
    AuthenticatedP192 = 0x05,
    Changed = 0x06,
    UnauthenticatedP256 = 0x07,
    AuthenticatedP256 = 0x08,
    /// No key or unknown type.
    #[default]
    None = 0xff,
}

impl LinkKeyType {
    /// Converts a raw octet, mapping out-of-range values to `None`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::Combination,
            0x01 => Self::LocalUnit,
            0x02 => Self::RemoteUnit,
            0x03 => Self::DebugCombination,
            0x04 => Self::UnauthenticatedP192,
            0x05 => Self::AuthenticatedP192,
            0x06 => Self::Changed,
            0x07 => Self::UnauthenticatedP256,
            0x08 => Self::AuthenticatedP256,
            _ => Self::None,
        }
    }
}

/// BR/EDR link key, derived over an LE Secure Connections pairing.
///
/// Octet layout (19 octets): responder flag, link-key type, key (16),
/// PIN length.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmpLinkKey {
    /// Key was distributed by the responder.
    pub responder: bool,
    pub key_type: LinkKeyType,
    pub key: [u8; 16],
    pub pin_length: u8,
}

impl SmpLinkKey {
    /// Encoded size in octets.
    pub const SIZE: usize = 19;

    /// A key of type [`LinkKeyType::None`] is invalid.
    pub fn is_valid(&self) -> bool {
        self.key_type != LinkKeyType::None
    }
}

impl ToBytes for SmpLinkKey {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        writer.write_u8(self.responder as u8)?;
        writer.write_u8(self.key_type as u8)?;
        writer.write_slice(&self.key)?;
        writer.write_u8(self.pin_length)
    }
}

impl FromBytes for SmpLinkKey {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(SmpLinkKey {
            responder: reader.read_u8()? != 0,
            key_type: LinkKeyType::from_u8(reader.read_u8()?),
            key: reader.read_array()?,
            pin_length: reader.read_u8()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::to_vec;

    #[test]
    fn ltk_layout() {
        let ltk = SmpLongTermKey {
            properties: SmpLtkProperties::RESPONDER | SmpLtkProperties::SC,
            enc_size: 16,
            ediv: 0x1122,
            rand: 0x0807060504030201,
            ltk: [0xaa; 16],
        };
        let bytes = to_vec(&ltk, SmpLongTermKey::SIZE).unwrap();
        assert_eq!(bytes.len(), SmpLongTermKey::SIZE);
        assert_eq!(bytes[0], 0b101);
        assert_eq!(bytes[1], 16);
        assert_eq!(&bytes[2..4], &[0x22, 0x11]);
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(SmpLongTermKey::from_bytes(&mut reader).unwrap(), ltk);
    }

    #[test]
    fn zero_enc_size_is_invalid() {
        let ltk = SmpLongTermKey::default();
        assert!(!ltk.is_valid());
        assert!(!ltk.is_responder());
    }

    #[test]
    fn short_key_sizes() {
        assert_eq!(SmpIdentityResolvingKey::SIZE, 17);
        assert_eq!(SmpSignatureResolvingKey::SIZE, 17);
        assert_eq!(SmpLinkKey::SIZE, 19);
    }

    #[test]
    fn link_key_round_trip() {
        let lk = SmpLinkKey {
            responder: true,
            key_type: LinkKeyType::AuthenticatedP256,
            key: [0x5a; 16],
            pin_length: 4,
        };
        let bytes = to_vec(&lk, SmpLinkKey::SIZE).unwrap();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(SmpLinkKey::from_bytes(&mut reader).unwrap(), lk);
        assert!(lk.is_valid());
        assert!(!SmpLinkKey::default().is_valid());
    }

    #[test]
    fn expectation_states() {
        assert!(SmpPairingState::PasskeyExpected.is_expectation_state());
        assert!(SmpPairingState::NumericCompareExpected.is_expectation_state());
        assert!(SmpPairingState::OobExpected.is_expectation_state());
        assert!(!SmpPairingState::KeyDistribution.is_expectation_state());
        assert!(!SmpPairingState::Completed.is_expectation_state());
    }

    #[test]
    fn security_level_ordering() {
        assert!(BtSecurityLevel::EncAuthFips > BtSecurityLevel::EncAuth);
        assert!(BtSecurityLevel::EncAuth > BtSecurityLevel::EncOnly);
        assert!(BtSecurityLevel::EncOnly > BtSecurityLevel::None);
        assert!(BtSecurityLevel::None > BtSecurityLevel::Unset);
    }
}
